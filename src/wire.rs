// Fixed-width structures exchanged with the SmartComm card printer driver,
// plus the UTF-16 text codec used by every text field inside them.

/// Maximum number of entries the driver writes into a device list.
pub const MAX_DEVICES: usize = 32;

pub const NAME_UNITS: usize = 128;
pub const ID_UNITS: usize = 64;
pub const DEV_UNITS: usize = 64;
pub const DESCRIPTION_UNITS: usize = 256;
pub const FACE_NAME_UNITS: usize = 32;

/// `openDevice` mode selecting a device by its description text.
pub const OPEN_BY_DESCRIPTION: i32 = 2;

/// One entry of the driver's device list.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawDeviceItem {
    pub name: [u16; NAME_UNITS],
    pub id: [u16; ID_UNITS],
    pub dev: [u16; DEV_UNITS],
    pub description: [u16; DESCRIPTION_UNITS],
    pub product_id: i32,
}

impl RawDeviceItem {
    pub const EMPTY: Self = Self {
        name: [0; NAME_UNITS],
        id: [0; ID_UNITS],
        dev: [0; DEV_UNITS],
        description: [0; DESCRIPTION_UNITS],
        product_id: 0,
    };
}

/// Caller-allocated buffer handed to `enumerateDevices`.
///
/// Only the first `count` items are meaningful; the rest is whatever the
/// driver left there.
#[repr(C)]
#[derive(Debug)]
pub struct RawDeviceList {
    pub count: i32,
    pub items: [RawDeviceItem; MAX_DEVICES],
}

impl RawDeviceList {
    /// Allocates a zeroed list on the heap (the struct is ~32 KiB).
    pub fn boxed() -> Box<Self> {
        Box::new(Self {
            count: 0,
            items: [RawDeviceItem::EMPTY; MAX_DEVICES],
        })
    }

    /// The entries the driver reported, with the count clamped to the array bound.
    pub fn valid_items(&self) -> &[RawDeviceItem] {
        let n = usize::try_from(self.count).unwrap_or(0).min(MAX_DEVICES);
        &self.items[..n]
    }
}

/// Text placement record consumed by `drawText`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawTextInfo {
    pub x: i32,
    pub y: i32,
    pub cx: i32,
    pub cy: i32,
    pub rotate: i32,
    pub align: i32,
    pub font_height: i32,
    pub font_width: i32,
    pub style: i32,
    pub color: u32,
    pub option: i32,
    pub face_name: [u16; FACE_NAME_UNITS],
}

/// Decodes a null-padded UTF-16 field, stopping at the first null unit.
///
/// Never reads past `units.len()`. Unpaired surrogates become U+FFFD.
pub fn decode_wide(units: &[u16]) -> String {
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}

/// Encodes `text` into a fixed field of `N` units, null terminated.
///
/// Returns `None` when the text needs more than `N - 1` units or contains an
/// embedded null, since either would change what the driver reads.
pub fn encode_wide<const N: usize>(text: &str) -> Option<[u16; N]> {
    let mut buf = [0u16; N];
    let mut len = 0;
    for unit in text.encode_utf16() {
        if unit == 0 || len + 1 >= N {
            return None;
        }
        buf[len] = unit;
        len += 1;
    }
    Some(buf)
}

/// Encodes variable-length text as a null-terminated UTF-16 string.
pub fn encode_wide_terminated(text: &str) -> Vec<u16> {
    text.encode_utf16()
        .take_while(|&u| u != 0)
        .chain(std::iter::once(0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field<const N: usize>(text: &str) -> [u16; N] {
        let mut buf = [0u16; N];
        for (slot, unit) in buf.iter_mut().zip(text.encode_utf16()) {
            *slot = unit;
        }
        buf
    }

    #[test]
    fn test_struct_sizes_match_driver_layout() {
        assert_eq!(std::mem::size_of::<RawDeviceItem>(), 1028);
        assert_eq!(std::mem::size_of::<RawDeviceList>(), 4 + 32 * 1028);
        assert_eq!(std::mem::size_of::<DrawTextInfo>(), 11 * 4 + 64);
    }

    #[test]
    fn test_decode_stops_at_first_null() {
        let mut buf: [u16; 16] = field("SMART-51");
        // garbage after the terminator must not leak into the result
        buf[9] = 'X' as u16;
        assert_eq!(decode_wide(&buf), "SMART-51");
    }

    #[test]
    fn test_decode_all_null_and_empty() {
        assert_eq!(decode_wide(&[0u16; 64]), "");
        assert_eq!(decode_wide(&[]), "");
    }

    #[test]
    fn test_decode_full_capacity_without_terminator() {
        let buf: [u16; 4] = field("ABCD");
        assert_eq!(decode_wide(&buf), "ABCD");
    }

    #[test]
    fn test_decode_non_ascii() {
        let buf: [u16; 32] = field("카드 프린터");
        assert_eq!(decode_wide(&buf), "카드 프린터");
    }

    #[test]
    fn test_encode_respects_terminator_room() {
        assert!(encode_wide::<4>("abc").is_some());
        assert!(encode_wide::<4>("abcd").is_none());

        let buf = encode_wide::<4>("abc").unwrap();
        assert_eq!(buf[3], 0);
        assert_eq!(decode_wide(&buf), "abc");
    }

    #[test]
    fn test_encode_rejects_embedded_null() {
        assert!(encode_wide::<16>("ab\0cd").is_none());
    }

    #[test]
    fn test_encode_terminated_appends_single_null() {
        let units = encode_wide_terminated("hi");
        assert_eq!(units, vec!['h' as u16, 'i' as u16, 0]);
        assert_eq!(encode_wide_terminated(""), vec![0]);
    }

    #[test]
    fn test_valid_items_clamps_count() {
        let mut list = RawDeviceList::boxed();
        list.count = 1000;
        assert_eq!(list.valid_items().len(), MAX_DEVICES);

        list.count = -3;
        assert!(list.valid_items().is_empty());

        list.count = 2;
        assert_eq!(list.valid_items().len(), 2);
    }
}
