// Communication hooks
// The byte-level transport lives outside this crate; devices only open and close it

use super::error::Result;

/// Open/close hooks for a device's communication channel.
///
/// Recovery actions typically reopen the channel; device close always closes it.
pub trait Communication: Send {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn is_open(&self) -> bool;
}

/// Channel for devices that have no transport of their own
#[derive(Debug, Default)]
pub struct NullCommunication {
    open: bool,
}

impl Communication for NullCommunication {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::error::DeviceError;
    use std::sync::{Arc, Mutex};

    /// Counters shared between a scripted channel and the test that owns it
    #[derive(Debug, Default, Clone)]
    pub struct CommunicationStats {
        pub opens: usize,
        pub closes: usize,
        pub fail_open: bool,
    }

    /// Communication channel that records calls and can be told to fail
    pub struct ScriptedCommunication {
        device: String,
        open: bool,
        stats: Arc<Mutex<CommunicationStats>>,
    }

    impl ScriptedCommunication {
        pub fn new(device: impl Into<String>) -> (Self, Arc<Mutex<CommunicationStats>>) {
            let stats = Arc::new(Mutex::new(CommunicationStats::default()));
            let comm = Self {
                device: device.into(),
                open: false,
                stats: Arc::clone(&stats),
            };
            (comm, stats)
        }
    }

    impl Communication for ScriptedCommunication {
        fn open(&mut self) -> Result<()> {
            let mut stats = self.stats.lock().unwrap();
            stats.opens += 1;
            if stats.fail_open {
                return Err(DeviceError::Communication {
                    device: self.device.clone(),
                    reason: "scripted open failure".to_string(),
                });
            }
            self.open = true;
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.stats.lock().unwrap().closes += 1;
            self.open = false;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }
}
