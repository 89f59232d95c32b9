// Scriptable in-process stand-in for the vendor driver.
//
// Every call is recorded in order so callers can assert exactly which entry
// points ran and with which handle.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{Handle, PixelBuffer, Rect, SmartDriver, Target};
use crate::wire::{decode_wide, DrawTextInfo, RawDeviceItem, RawDeviceList, DESCRIPTION_UNITS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Enumerate,
    Open,
    DrawImage,
    DrawText,
    Commit,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Enumerate,
    Open {
        descriptor: String,
        mode: i32,
    },
    DrawImage {
        handle: usize,
        target: Target,
        rect: Rect,
        width: u32,
        height: u32,
    },
    DrawText {
        handle: usize,
        target: Target,
        text: String,
        face_name: String,
        font_height: i32,
        color: u32,
    },
    Commit {
        handle: usize,
    },
    Close {
        handle: usize,
    },
}

impl DriverCall {
    pub fn kind(&self) -> CallKind {
        match self {
            DriverCall::Enumerate => CallKind::Enumerate,
            DriverCall::Open { .. } => CallKind::Open,
            DriverCall::DrawImage { .. } => CallKind::DrawImage,
            DriverCall::DrawText { .. } => CallKind::DrawText,
            DriverCall::Commit { .. } => CallKind::Commit,
            DriverCall::Close { .. } => CallKind::Close,
        }
    }
}

/// A device the mock reports from enumeration.
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub name: String,
    pub id: String,
    pub dev: String,
    pub description: String,
    pub product_id: i32,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            name: "SMART-51 Card Printer".to_string(),
            id: "SMART51".to_string(),
            dev: "USB001".to_string(),
            description: "IDP SMART-51 Dual (USB001)".to_string(),
            product_id: 0x51,
        }
    }
}

#[derive(Default)]
struct MockState {
    devices: Vec<MockDevice>,
    reported_count: Option<i32>,
    enumerate_status: i32,
    open_status: i32,
    null_handle: bool,
    draw_failures: HashMap<usize, i32>,
    commit_status: i32,
    close_status: i32,
    stalls: HashMap<CallKind, Duration>,
    draws_issued: usize,
    opens_issued: usize,
    calls: Vec<DriverCall>,
}

#[derive(Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
}

impl MockDriver {
    /// A driver with no attached devices where every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, device: MockDevice) -> Self {
        self.lock().devices.push(device);
        self
    }

    /// Overrides the count the driver writes, e.g. to simulate a corrupt list.
    pub fn with_reported_count(self, count: i32) -> Self {
        self.lock().reported_count = Some(count);
        self
    }

    pub fn fail_enumerate(self, code: i32) -> Self {
        self.lock().enumerate_status = code;
        self
    }

    pub fn fail_open(self, code: i32) -> Self {
        self.lock().open_status = code;
        self
    }

    /// Report success from open but hand back a null handle.
    pub fn with_null_handle(self) -> Self {
        self.lock().null_handle = true;
        self
    }

    /// Fails the draw call at `index`, counting image and text draws together.
    pub fn fail_draw_at(self, index: usize, code: i32) -> Self {
        self.lock().draw_failures.insert(index, code);
        self
    }

    pub fn fail_commit(self, code: i32) -> Self {
        self.lock().commit_status = code;
        self
    }

    pub fn fail_close(self, code: i32) -> Self {
        self.lock().close_status = code;
        self
    }

    /// Blocks the calling thread for `delay` whenever `kind` is called.
    pub fn stall_on(self, kind: CallKind, delay: Duration) -> Self {
        self.lock().stalls.insert(kind, delay);
        self
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock().calls.clone()
    }

    pub fn call_kinds(&self) -> Vec<CallKind> {
        self.lock().calls.iter().map(DriverCall::kind).collect()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.lock().calls.iter().filter(|c| c.kind() == kind).count()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: DriverCall) -> Option<Duration> {
        let mut state = self.lock();
        let stall = state.stalls.get(&call.kind()).copied();
        state.calls.push(call);
        stall
    }
}

fn stall(delay: Option<Duration>) {
    if let Some(delay) = delay {
        std::thread::sleep(delay);
    }
}

/// Copies `text` into `field`, then fills what follows the terminator with
/// junk the way uninitialised driver memory would look.
fn fill_field(field: &mut [u16], text: &str) {
    let mut len = 0;
    for (slot, unit) in field.iter_mut().zip(text.encode_utf16()) {
        *slot = unit;
        len += 1;
    }
    if len < field.len() {
        field[len] = 0;
        for slot in field.iter_mut().skip(len + 1) {
            *slot = u16::from(b'#');
        }
    }
}

impl SmartDriver for MockDriver {
    fn enumerate_devices(&self, list: &mut RawDeviceList) -> i32 {
        let delay = self.record(DriverCall::Enumerate);
        stall(delay);

        let state = self.lock();
        if state.enumerate_status != 0 {
            return state.enumerate_status;
        }

        for (item, device) in list.items.iter_mut().zip(&state.devices) {
            fill_field(&mut item.name, &device.name);
            fill_field(&mut item.id, &device.id);
            fill_field(&mut item.dev, &device.dev);
            fill_field(&mut item.description, &device.description);
            item.product_id = device.product_id;
        }
        // entries past the real devices hold stale data
        for item in list.items.iter_mut().skip(state.devices.len()) {
            *item = RawDeviceItem::EMPTY;
            fill_field(&mut item.name, "stale entry");
        }

        let count = i32::try_from(state.devices.len()).unwrap_or(i32::MAX);
        list.count = state.reported_count.unwrap_or(count);
        0
    }

    fn open_device(&self, descriptor: &[u16; DESCRIPTION_UNITS], mode: i32) -> (i32, usize) {
        let delay = self.record(DriverCall::Open {
            descriptor: decode_wide(descriptor),
            mode,
        });
        stall(delay);

        let mut state = self.lock();
        if state.open_status != 0 {
            return (state.open_status, 0);
        }
        if state.null_handle {
            return (0, 0);
        }
        state.opens_issued += 1;
        (0, 0x1000 + state.opens_issued)
    }

    fn draw_image(&self, handle: Handle, target: Target, rect: Rect, image: &PixelBuffer) -> i32 {
        let delay = self.record(DriverCall::DrawImage {
            handle: handle.as_raw(),
            target,
            rect,
            width: image.width,
            height: image.height,
        });
        stall(delay);
        self.next_draw_status()
    }

    fn draw_text(&self, handle: Handle, target: Target, info: &DrawTextInfo, text: &[u16]) -> i32 {
        let delay = self.record(DriverCall::DrawText {
            handle: handle.as_raw(),
            target,
            text: decode_wide(text),
            face_name: decode_wide(&info.face_name),
            font_height: info.font_height,
            color: info.color,
        });
        stall(delay);
        self.next_draw_status()
    }

    fn commit_print(&self, handle: Handle) -> i32 {
        let delay = self.record(DriverCall::Commit {
            handle: handle.as_raw(),
        });
        stall(delay);
        self.lock().commit_status
    }

    fn close_device(&self, handle: Handle) -> i32 {
        let delay = self.record(DriverCall::Close {
            handle: handle.as_raw(),
        });
        stall(delay);
        self.lock().close_status
    }

    fn type_name(&self) -> &'static str {
        "Mock SmartComm Driver"
    }
}

impl MockDriver {
    fn next_draw_status(&self) -> i32 {
        let mut state = self.lock();
        let index = state.draws_issued;
        state.draws_issued += 1;
        state.draw_failures.get(&index).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_writes_devices_and_count() {
        let driver = MockDriver::new()
            .with_device(MockDevice::default())
            .with_device(MockDevice {
                name: "Second".to_string(),
                ..MockDevice::default()
            });
        let mut list = RawDeviceList::boxed();

        assert_eq!(driver.enumerate_devices(&mut list), 0);
        assert_eq!(list.count, 2);
        assert_eq!(decode_wide(&list.items[1].name), "Second");
        assert_eq!(decode_wide(&list.items[2].name), "stale entry");
    }

    #[test]
    fn test_fill_field_leaves_junk_after_terminator() {
        let mut field = [0u16; 8];
        fill_field(&mut field, "ab");
        assert_eq!(field[2], 0);
        assert_eq!(field[3], u16::from(b'#'));
        assert_eq!(decode_wide(&field), "ab");
    }

    #[test]
    fn test_open_hands_out_distinct_handles() {
        let driver = MockDriver::new();
        let desc = [0u16; DESCRIPTION_UNITS];
        let (_, first) = driver.open_device(&desc, 2);
        let (_, second) = driver.open_device(&desc, 2);
        assert_ne!(first, second);
        assert_eq!(driver.count(CallKind::Open), 2);
    }

    #[test]
    fn test_draw_failure_is_indexed_across_kinds() {
        let driver = MockDriver::new().fail_draw_at(1, 9);
        let handle = Handle::from_raw(1).unwrap();
        let target = Target { page: 0, panel: 1 };
        let image = PixelBuffer {
            width: 1,
            height: 1,
            pixels: vec![0, 0, 0],
        };
        let rect = Rect {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
        };
        let info = DrawTextInfo {
            x: 0,
            y: 0,
            cx: 0,
            cy: 0,
            rotate: 0,
            align: 0,
            font_height: 10,
            font_width: 0,
            style: 0,
            color: 0,
            option: 0,
            face_name: [0; 32],
        };

        assert_eq!(driver.draw_image(handle, target, rect, &image), 0);
        assert_eq!(driver.draw_text(handle, target, &info, &[0]), 9);
        assert_eq!(
            driver.call_kinds(),
            vec![CallKind::DrawImage, CallKind::DrawText]
        );
    }
}
