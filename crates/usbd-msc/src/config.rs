//! Static configuration of the mass-storage function.

use thiserror::Error;

/// Default bulk OUT endpoint id (CBW and data-out traffic).
pub const DEFAULT_EP_OUT: u8 = 1;
/// Default bulk IN endpoint id (data-in and CSW traffic).
pub const DEFAULT_EP_IN: u8 = 2;
/// High-speed bulk max packet size.
pub const DEFAULT_MAX_PACKET_SIZE: u16 = 512;

/// Configuration rejected at construction time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} is {len} bytes, at most {max} ASCII bytes allowed")]
    StringTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{field} must be ASCII")]
    NotAscii { field: &'static str },
    #[error("max_luns {0} is outside 1..=15")]
    BadLunCount(u8),
    #[error("transfer buffer length {0} is not a non-zero power of two")]
    BadBufferLength(usize),
    #[error("bulk endpoints must differ")]
    EndpointClash,
}

/// Identification strings and transport parameters of the function.
#[derive(Debug, Clone)]
pub struct MscConfig {
    /// INQUIRY vendor identification, at most 8 ASCII bytes.
    pub vendor: String,
    /// INQUIRY product identification, at most 16 ASCII bytes.
    pub product: String,
    /// INQUIRY product revision, at most 4 ASCII bytes.
    pub revision: String,
    /// Number of logical units, 1..=15. LUN 0 is always present.
    pub max_luns: u8,
    /// Bulk OUT endpoint id.
    pub ep_out: u8,
    /// Bulk IN endpoint id.
    pub ep_in: u8,
    /// Bulk max packet size.
    pub max_packet_size: u16,
}

impl Default for MscConfig {
    fn default() -> Self {
        MscConfig {
            vendor: "GENERIC".into(),
            product: "MASS STORAGE".into(),
            revision: "0.1".into(),
            max_luns: 1,
            ep_out: DEFAULT_EP_OUT,
            ep_in: DEFAULT_EP_IN,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl MscConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_string("vendor", &self.vendor, 8)?;
        check_string("product", &self.product, 16)?;
        check_string("revision", &self.revision, 4)?;
        if !(1..=15).contains(&self.max_luns) {
            return Err(ConfigError::BadLunCount(self.max_luns));
        }
        if self.ep_in == self.ep_out {
            return Err(ConfigError::EndpointClash);
        }
        Ok(())
    }
}

fn check_string(field: &'static str, value: &str, max: usize) -> Result<(), ConfigError> {
    if !value.is_ascii() {
        return Err(ConfigError::NotAscii { field });
    }
    if value.len() > max {
        return Err(ConfigError::StringTooLong {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}
