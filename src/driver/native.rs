// SmartComm2 vendor library bound at runtime through libloading.

use libloading::Library;
use std::ffi::c_void;
use std::path::{Path, PathBuf};

use super::{Handle, PixelBuffer, Rect, SmartDriver, Target};
use crate::errors::DriverError;
use crate::wire::{DrawTextInfo, RawDeviceList, DESCRIPTION_UNITS};

type GetDeviceListFn = unsafe extern "system" fn(*mut c_void) -> i32;
type OpenDeviceFn = unsafe extern "system" fn(*mut *mut c_void, *mut c_void, i32) -> i32;
type DrawImageFn = unsafe extern "system" fn(
    *mut c_void,
    u8,
    u8,
    i32,
    i32,
    i32,
    i32,
    *mut c_void,
    *mut c_void,
) -> i32;
type DrawTextFn = unsafe extern "system" fn(*mut c_void, u8, u8, *mut c_void, *mut c_void) -> i32;
type HandleFn = unsafe extern "system" fn(*mut c_void) -> i32;

/// Image header the driver reads pixel data through.
#[repr(C)]
struct RawImage {
    width: i32,
    height: i32,
    stride: i32,
    bits_per_pixel: i32,
    pixels: *const u8,
}

pub struct NativeDriver {
    path: PathBuf,
    get_device_list: GetDeviceListFn,
    open_device: OpenDeviceFn,
    draw_image: DrawImageFn,
    draw_text: DrawTextFn,
    print: HandleFn,
    close_device: HandleFn,
    // keeps the function pointers above valid
    _library: Library,
}

impl NativeDriver {
    pub fn load(path: &Path) -> Result<Self, DriverError> {
        // SAFETY: loading runs the library's initialisers; the vendor DLL is
        // trusted to the same degree as the device it drives.
        let library = unsafe { Library::new(path) }
            .map_err(|e| DriverError::Library(format!("{}: {}", path.display(), e)))?;

        // SAFETY: each type alias matches the exported signature.
        unsafe {
            Ok(Self {
                get_device_list: symbol(&library, b"SmartComm_GetDeviceList2\0")?,
                open_device: symbol(&library, b"SmartComm_OpenDevice2\0")?,
                draw_image: symbol(&library, b"SmartComm_DrawImage\0")?,
                draw_text: symbol(&library, b"SmartComm_DrawText2\0")?,
                print: symbol(&library, b"SmartComm_Print\0")?,
                close_device: symbol(&library, b"SmartComm_CloseDevice\0")?,
                path: path.to_path_buf(),
                _library: library,
            })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T, DriverError> {
    library.get::<T>(name).map(|s| *s).map_err(|e| {
        let export = String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name));
        DriverError::Library(format!("missing export {}: {}", export, e))
    })
}

fn raw(handle: Handle) -> *mut c_void {
    handle.as_raw() as *mut c_void
}

impl SmartDriver for NativeDriver {
    fn enumerate_devices(&self, list: &mut RawDeviceList) -> i32 {
        // SAFETY: `list` is a #[repr(C)] buffer sized exactly as the driver expects.
        unsafe { (self.get_device_list)((list as *mut RawDeviceList).cast()) }
    }

    fn open_device(&self, descriptor: &[u16; DESCRIPTION_UNITS], mode: i32) -> (i32, usize) {
        let mut handle: *mut c_void = std::ptr::null_mut();
        let mut descriptor = *descriptor;
        // SAFETY: both pointers are valid for the duration of the call and the
        // descriptor is null terminated within its capacity.
        let status =
            unsafe { (self.open_device)(&mut handle, descriptor.as_mut_ptr().cast(), mode) };
        (status, handle as usize)
    }

    fn draw_image(&self, handle: Handle, target: Target, rect: Rect, image: &PixelBuffer) -> i32 {
        let mut header = RawImage {
            width: image.width as i32,
            height: image.height as i32,
            stride: image.stride() as i32,
            bits_per_pixel: PixelBuffer::BITS_PER_PIXEL as i32,
            pixels: image.pixels.as_ptr(),
        };
        // SAFETY: `header` and the pixel data it points to outlive the call.
        unsafe {
            (self.draw_image)(
                raw(handle),
                target.page,
                target.panel,
                rect.x,
                rect.y,
                rect.width,
                rect.height,
                (&mut header as *mut RawImage).cast(),
                std::ptr::null_mut(),
            )
        }
    }

    fn draw_text(&self, handle: Handle, target: Target, info: &DrawTextInfo, text: &[u16]) -> i32 {
        let mut info = *info;
        let mut text = text.to_vec();
        // SAFETY: `info` is #[repr(C)] and `text` is null terminated; both
        // outlive the call.
        unsafe {
            (self.draw_text)(
                raw(handle),
                target.page,
                target.panel,
                (&mut info as *mut DrawTextInfo).cast(),
                text.as_mut_ptr().cast(),
            )
        }
    }

    fn commit_print(&self, handle: Handle) -> i32 {
        // SAFETY: `handle` came from a successful open and has not been closed.
        unsafe { (self.print)(raw(handle)) }
    }

    fn close_device(&self, handle: Handle) -> i32 {
        // SAFETY: as above; the session forgets the handle before this call.
        unsafe { (self.close_device)(raw(handle)) }
    }

    fn type_name(&self) -> &'static str {
        "SmartComm2 native driver"
    }
}
