//! The headless front-end: no window, no events, just the lifecycle
//! contract the simulator loop drives.
use cpu::{Gui, GuiError};

#[derive(Debug, Default)]
pub struct HeadlessGui {
    running: bool,
}

impl HeadlessGui {
    pub fn new() -> HeadlessGui {
        HeadlessGui::default()
    }
}

impl Gui for HeadlessGui {
    fn running(&self) -> bool {
        self.running
    }

    fn update(&mut self) -> Result<(), GuiError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), GuiError> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let mut gui = HeadlessGui::new();
        assert!(!gui.running());
        gui.start().unwrap();
        assert!(gui.running());
        gui.update().unwrap();
        gui.stop();
        assert!(!gui.running());
    }
}
