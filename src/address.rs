use crate::AvError;

/// A Bluetooth Device Address (`BD_ADDR`) wrapper for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, defmt::Format)]
pub struct PeerAddress(pub [u8; 6]);

impl PeerAddress {
    /// The empty (all-zero) address, used as the "no peer" sentinel for the
    /// active-peer slot and for events that carry no address
    pub const EMPTY: PeerAddress = PeerAddress([0; 6]);

    /// Create a new peer address from bytes
    #[must_use]
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Get the raw address bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Check whether this is the empty sentinel address
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Format the address as a colon-separated hex string
    #[must_use]
    pub fn format_hex(&self) -> heapless::String<17> {
        let mut result = heapless::String::new();
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                result.push(':').ok();
            }
            let hex_chars = [
                '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F',
            ];
            result.push(hex_chars[(byte >> 4) as usize]).ok();
            result.push(hex_chars[(byte & 0x0F) as usize]).ok();
        }
        result
    }

    /// Parse a peer address from a colon-separated hex string
    ///
    /// # Errors
    /// Returns `AvError::InvalidParameter` if the string is not exactly 17
    /// characters long or contains invalid characters
    pub fn from_hex(hex: &str) -> Result<Self, AvError> {
        if hex.len() != 17 || !hex.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
            return Err(AvError::InvalidParameter);
        }

        let mut bytes = [0u8; 6];
        for (i, byte) in hex.split(':').enumerate() {
            if i >= 6 || byte.len() != 2 {
                return Err(AvError::InvalidParameter);
            }
            bytes[i] = u8::from_str_radix(byte, 16).map_err(|_| AvError::InvalidParameter)?;
        }
        Ok(Self(bytes))
    }
}

impl From<[u8; 6]> for PeerAddress {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<PeerAddress> for [u8; 6] {
    fn from(addr: PeerAddress) -> Self {
        addr.0
    }
}

impl From<PeerAddress> for heapless::String<17> {
    fn from(addr: PeerAddress) -> Self {
        addr.format_hex()
    }
}

impl TryFrom<&str> for PeerAddress {
    type Error = AvError;

    fn try_from(hex: &str) -> Result<Self, Self::Error> {
        PeerAddress::from_hex(hex)
    }
}

impl TryFrom<&[u8]> for PeerAddress {
    type Error = AvError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() == 6 {
            let mut addr = [0u8; 6];
            addr.copy_from_slice(bytes);
            Ok(Self(addr))
        } else {
            Err(AvError::InvalidParameter)
        }
    }
}
