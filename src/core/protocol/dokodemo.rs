//! Dokodemo-door: no header, every connection goes to one fixed target

use crate::core::address::Destination;

/// Static forwarding target of a dokodemo-door instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DokodemoTarget {
    destination: Destination,
}

impl DokodemoTarget {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            destination: Destination::new(address, port),
        }
    }

    /// Nothing is read from the client
    pub fn decode(&self) -> Destination {
        self.destination.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_returns_static_target() {
        let target = DokodemoTarget::new("10.0.0.9", 5432);
        assert_eq!(target.decode(), Destination::new("10.0.0.9", 5432));
        assert_eq!(target.decode(), target.decode());
    }
}
