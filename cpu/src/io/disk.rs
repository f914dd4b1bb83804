//! The Diablo disk controller: two drives, the KSTAT/KDATA/KADR/KCOM
//! registers, the sector timer that wakes the sector task, and the
//! word timer that streams sector words past the word task.
//!
//! Drive contents are full AltoFS images (see the `fs` crate); a
//! sector streams as its two header words, eight label words and 256
//! data words.
use std::collections::VecDeque;
use std::path::Path;

use tracing::{event, Level};

use base::Task;
use fs::{AltoFs, FsError, Geometry, ImageFormat, PAGE_DATA_SIZE};

/// Microcycles between sector marks (one sector of a 3600 rpm pack
/// at the 170 ns microcycle).
pub const SECTOR_CYCLES: u64 = 8160;

/// Microcycles per streamed word during a transfer.
pub const WORD_CYCLES: u64 = 56;

/// Words in one streamed sector: header, label, data.
pub const SECTOR_WORDS: usize = 2 + 8 + PAGE_DATA_SIZE / 2;

// KCOM bits.
/// Transfers are inhibited while set.
pub const KCOM_XFEROFF: u16 = 0x0010;
/// Word-task wakeups are inhibited while set.
pub const KCOM_WDINHIB: u16 = 0x0008;

// KSTAT bits below the sector number field.
pub const KSTAT_IDLE: u16 = 0x0040;
pub const KSTAT_CHECKSUM_ERROR: u16 = 0x0001;

struct Drive {
    image: AltoFs,
    cylinder: u16,
}

/// The controller.
pub struct Disk {
    drives: [Option<Drive>; 2],
    kstat: u16,
    kdata: u16,
    kadr: u16,
    kcom: u16,
    sector: u16,
    recno: u8,
    /// Words of the sector being streamed to the word task.
    xfer: VecDeque<u16>,
}

impl Disk {
    pub fn new() -> Disk {
        Disk {
            drives: [None, None],
            kstat: KSTAT_IDLE,
            kdata: 0,
            kadr: 0,
            kcom: 0,
            sector: 0,
            recno: 0,
            xfer: VecDeque::new(),
        }
    }

    pub fn reset(&mut self) {
        self.kstat = KSTAT_IDLE;
        self.kdata = 0;
        self.kadr = 0;
        self.kcom = 0;
        self.sector = 0;
        self.recno = 0;
        self.xfer.clear();
        for drive in self.drives.iter_mut().flatten() {
            drive.cylinder = 0;
        }
    }

    /// Loads a pack image into drive `unit`.
    pub fn load_image(&mut self, unit: usize, path: &Path, format: ImageFormat) -> Result<(), FsError> {
        let mut image = AltoFs::new(Geometry::standard_diablo())?;
        image.load_image(path, format)?;
        event!(Level::INFO, "drive {unit}: loaded `{}`", path.display());
        self.drives[unit & 1] = Some(Drive { image, cylinder: 0 });
        Ok(())
    }

    /// Writes drive `unit` back to a file.
    pub fn save_image(&self, unit: usize, path: &Path, format: ImageFormat) -> Result<(), FsError> {
        match &self.drives[unit & 1] {
            Some(drive) => drive.image.save_image(path, format),
            None => Err(FsError::FileNotFound(format!("no pack in drive {unit}"))),
        }
    }

    /// Direct access to a mounted pack (the debugger pokes around
    /// with this).
    pub fn drive_fs(&self, unit: usize) -> Option<&AltoFs> {
        self.drives[unit & 1].as_ref().map(|d| &d.image)
    }

    pub fn kstat(&self) -> u16 {
        (self.sector << 12) | (self.kstat & 0x0FFF)
    }

    pub fn kdata(&self) -> u16 {
        self.kdata
    }

    pub fn kadr(&self) -> u16 {
        self.kadr
    }

    pub fn kcom(&self) -> u16 {
        self.kcom
    }

    // Register strobes, dispatched from the disk tasks' F1 codes.

    pub fn load_kstat(&mut self, bus: u16) {
        // The sector field is owned by the hardware; microcode only
        // writes the status bits.
        self.kstat = (self.kstat & 0xF000) | (bus & 0x0FFF);
    }

    pub fn load_kdata(&mut self, bus: u16) {
        self.kdata = bus;
    }

    pub fn load_kadr(&mut self, bus: u16) {
        self.kadr = bus;
    }

    pub fn load_kcom(&mut self, bus: u16) {
        self.kcom = bus;
        if self.kcom & KCOM_XFEROFF != 0 {
            self.xfer.clear();
        }
    }

    pub fn clear_status(&mut self) {
        self.kstat &= 0xF000;
        self.kstat |= KSTAT_IDLE;
    }

    pub fn increment_recno(&mut self) {
        self.recno = (self.recno + 1) & 3;
    }

    /// F1=STROBE: move the heads to the cylinder named by KADR.
    /// Seeks complete instantly.
    pub fn strobe(&mut self) {
        let unit = usize::from((self.kadr >> 1) & 1);
        let cylinder = (self.kadr >> 3) & 0x1FF;
        if let Some(drive) = self.drives[unit].as_mut() {
            drive.cylinder = cylinder;
            event!(Level::DEBUG, "drive {unit}: seek to cylinder {cylinder}");
        }
    }

    // Branch conditions, dispatched from the disk tasks' F2 codes.

    pub fn branch_on_recno(&self) -> u16 {
        u16::from(self.recno) << 2
    }

    pub fn branch_on_xfrdat(&self) -> u16 {
        u16::from(!self.xfer.is_empty()) << 2
    }

    pub fn branch_on_not_ready(&self) -> u16 {
        let unit = usize::from((self.kadr >> 1) & 1);
        u16::from(self.drives[unit].is_none()) << 2
    }

    /// One sector mark.  Advances the sector counter, wakes the
    /// sector task, and begins streaming the addressed sector when a
    /// transfer is armed.  Returns the pending bits to raise.
    pub fn sector_tick(&mut self) -> u16 {
        self.sector = (self.sector + 1) % Geometry::standard_diablo().num_sectors;
        let mut wake = Task::DiskSector.mask();

        if self.kcom & KCOM_XFEROFF == 0 && self.transfer_matches() {
            self.begin_transfer();
            if self.kcom & KCOM_WDINHIB == 0 && !self.xfer.is_empty() {
                wake |= Task::DiskWord.mask();
            }
        }
        wake
    }

    fn transfer_matches(&self) -> bool {
        let unit = usize::from((self.kadr >> 1) & 1);
        let drive = match &self.drives[unit] {
            Some(d) => d,
            None => return false,
        };
        let sector = (self.kadr >> 12) & 0xF;
        let cylinder = (self.kadr >> 3) & 0x1FF;
        sector == self.sector && cylinder == drive.cylinder
    }

    fn begin_transfer(&mut self) {
        let unit = usize::from((self.kadr >> 1) & 1);
        // The drive bit is the unit already selected; the image's
        // geometry wants it clear.
        let rda = self.kadr & !0x0003;
        let drive = self.drives[unit].as_ref().expect("transfer_matches checked");
        let vda = match drive.image.geometry().rda_to_vda(rda) {
            Ok(vda) => vda,
            Err(e) => {
                event!(Level::WARN, "transfer aborted: {e}");
                self.kstat |= KSTAT_CHECKSUM_ERROR;
                return;
            }
        };
        let page = drive.image.page(vda).expect("vda from geometry");
        let mut words = Vec::with_capacity(SECTOR_WORDS);
        words.extend(page.header);
        words.extend(page.label.to_words());
        for widx in 0..PAGE_DATA_SIZE / 2 {
            words.push(fs::data_word(&page.data, widx));
        }
        self.xfer = words.into();
        self.kstat &= !KSTAT_IDLE;
        event!(
            Level::DEBUG,
            "drive {unit}: streaming sector at VDA {vda} ({SECTOR_WORDS} words)"
        );
    }

    /// One word time during a transfer.  Streams the next word into
    /// KDATA and wakes the word task; at the end of the sector the
    /// controller goes idle again.  Returns the pending bits to
    /// raise.
    pub fn word_tick(&mut self) -> u16 {
        match self.xfer.pop_front() {
            Some(word) => {
                self.kdata = word;
                if self.xfer.is_empty() {
                    self.kstat |= KSTAT_IDLE;
                }
                if self.kcom & KCOM_WDINHIB == 0 {
                    Task::DiskWord.mask()
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    /// Whether a transfer is in progress (drives the word-task
    /// timer).
    pub fn transferring(&self) -> bool {
        !self.xfer.is_empty()
    }

    /// The register dump the debugger prints.
    pub fn registers_string(&self) -> String {
        format!(
            "KSTAT: {:06o}   KDATA: {:06o}   KADR : {:06o}   KCOM : {:06o}\n\
             SECT : {:02o}       RECNO: {}        XFER : {} words\n\
             DRIVE0: {}   DRIVE1: {}",
            self.kstat(),
            self.kdata,
            self.kadr,
            self.kcom,
            self.sector,
            self.recno,
            self.xfer.len(),
            if self.drives[0].is_some() { "loaded" } else { "empty" },
            if self.drives[1].is_some() { "loaded" } else { "empty" },
        )
    }
}

impl Default for Disk {
    fn default() -> Disk {
        Disk::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs::InsertOptions;

    fn controller_with_pack() -> Disk {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pack.dsk");
        let mut image = AltoFs::new(Geometry::standard_diablo()).unwrap();
        image.format(99).unwrap();
        image
            .insert_file("marker.dat", &[0x5A; 64], 100, InsertOptions::default())
            .unwrap();
        image.save_image(&path, ImageFormat::Raw).unwrap();

        let mut disk = Disk::new();
        disk.load_image(0, &path, ImageFormat::Raw).unwrap();
        disk
    }

    #[test]
    fn sector_counter_rides_the_sector_ticks() {
        let mut disk = controller_with_pack();
        assert_eq!(disk.kstat() >> 12, 0);
        let wake = disk.sector_tick();
        assert_ne!(wake & Task::DiskSector.mask(), 0);
        assert_eq!(disk.kstat() >> 12, 1);
        for _ in 0..11 {
            disk.sector_tick();
        }
        assert_eq!(disk.kstat() >> 12, 0);
    }

    #[test]
    fn armed_transfer_streams_the_addressed_sector() {
        let mut disk = controller_with_pack();
        // Address cylinder 0, head 0, sector 2 of unit 0 and arm the
        // transfer.
        disk.load_kadr(2 << 12);
        disk.load_kcom(0);
        disk.strobe();

        // Sector marks 1 and 2; the second one matches.
        assert_eq!(disk.sector_tick() & Task::DiskWord.mask(), 0);
        let wake = disk.sector_tick();
        assert_ne!(wake & Task::DiskWord.mask(), 0);
        assert!(disk.transferring());

        // The streamed words are the sector image: header first.
        let vda = 2;
        let mut words = Vec::new();
        while disk.transferring() {
            disk.word_tick();
            words.push(disk.kdata());
        }
        assert_eq!(words.len(), SECTOR_WORDS);
        let image = disk.drive_fs(0).unwrap();
        let page = image.page(vda).unwrap();
        assert_eq!(words[0], page.header[0]);
        assert_eq!(&words[2..10], &page.label.to_words());
        assert_ne!(disk.kstat() & KSTAT_IDLE, 0);
    }

    #[test]
    fn xferoff_inhibits_transfers() {
        let mut disk = controller_with_pack();
        disk.load_kadr(1 << 12);
        disk.load_kcom(KCOM_XFEROFF);
        disk.sector_tick();
        assert!(!disk.transferring());
    }

    #[test]
    fn not_ready_branch_reports_an_empty_drive() {
        let mut disk = controller_with_pack();
        assert_eq!(disk.branch_on_not_ready(), 0);
        // Select unit 1, which has no pack.
        disk.load_kadr(1 << 1);
        assert_eq!(disk.branch_on_not_ready(), 1 << 2);
    }

    #[test]
    fn recno_counts_modulo_four() {
        let mut disk = Disk::new();
        assert_eq!(disk.branch_on_recno(), 0);
        disk.increment_recno();
        disk.increment_recno();
        assert_eq!(disk.branch_on_recno(), 2 << 2);
        disk.increment_recno();
        disk.increment_recno();
        assert_eq!(disk.branch_on_recno(), 0);
    }
}
