//! Controllers that are recognised by name but cannot be driven here

use crate::error::{FloppyError, HardwareFault, Result};
use crate::hw::{Backend, DeviceInfo, FluxDevice};

/// A registry entry that never finds a device
#[derive(Debug, Clone, Copy)]
pub struct UnavailableBackend {
    name: &'static str,
    description: &'static str,
    reason: &'static str,
}

impl UnavailableBackend {
    /// Applesauce; its serial protocol is undocumented
    pub const APPLESAUCE: Self = Self {
        name: "applesauce",
        description: "Applesauce floppy controller",
        reason: "the Applesauce protocol is not published",
    };

    /// Catweasel ISA/PCI boards
    pub const CATWEASEL: Self = Self {
        name: "catweasel",
        description: "Catweasel MK3/MK4",
        reason: "Catweasel needs a kernel driver for port I/O",
    };

    /// Pauline network controller
    pub const PAULINE: Self = Self {
        name: "pauline",
        description: "Pauline floppy controller",
        reason: "Pauline is driven through its own web interface",
    };
}

impl Backend for UnavailableBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn enumerate(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }

    fn open(&self, path: &str) -> Result<Box<dyn FluxDevice>> {
        Err(FloppyError::hardware(
            self.name,
            HardwareFault::NotSupported,
            0,
            format!("cannot open {}: {}", path, self.reason),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_never_opens() {
        let b = UnavailableBackend::PAULINE;
        assert!(b.enumerate().is_empty());
        assert_eq!(b.open("pauline.local").err().unwrap().kind(), ErrorKind::Unsupported);
    }
}
