//! Device identity derived from the station MAC and the boot session

use core::fmt::Write as _;

use heapless::String;
use wattlog_core::config::DeviceIdentity;

/// `aa:bb:cc:dd:ee:ff`
pub type MacString = String<17>;

pub fn format_mac(mac: [u8; 6]) -> MacString {
    let mut s = MacString::new();
    for (idx, byte) in mac.iter().enumerate() {
        let _ = core::write!(s, "{:02x}", byte);
        if idx != mac.len() - 1 {
            let _ = s.push(':');
        }
    }
    s
}

#[derive(Debug, Clone)]
pub struct BoardIdentity {
    session_id: u32,
    device_id: MacString,
}

impl BoardIdentity {
    pub fn new(mac: [u8; 6], session_id: u32) -> Self {
        Self {
            session_id,
            device_id: format_mac(mac),
        }
    }
}

impl DeviceIdentity for BoardIdentity {
    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}
