// D3D11 device singleton shared by every stream.
//
// The immediate context is used concurrently by capture workers
// (CopyResource) and host threads (Map/Unmap on staging textures);
// multithread protection on the context is the invariant that makes that
// legal. No other D3D11 state is shared mutably.

pub mod readback;
pub(crate) mod rescale;

use std::sync::{Arc, Mutex, PoisonError};

use windows::core::Interface;
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_11_1,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Multithread,
    D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_SDK_VERSION,
};
use windows::Win32::Graphics::Dxgi::IDXGIDevice;

use crate::error::{CaptureError, ErrorKind, Result};

/// Shared Direct3D 11 device, immediate context and DXGI view of the device.
pub(crate) struct GpuContext {
    pub device: ID3D11Device,
    pub context: ID3D11DeviceContext,
    pub dxgi_device: IDXGIDevice,
}

static SHARED: Mutex<Option<Arc<GpuContext>>> = Mutex::new(None);

/// Create the process-wide device if it does not exist yet. Idempotent.
pub fn initialize() -> Result<()> {
    acquire().map(|_| ())
}

/// Release the process-wide device reference.
///
/// Streams still holding the context keep it alive until they close; call
/// this after the last stream is gone to actually free the device.
pub fn finalize() {
    SHARED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
}

/// Shared device handle, initializing on first use.
pub(crate) fn acquire() -> Result<Arc<GpuContext>> {
    let mut shared = SHARED.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(context) = shared.as_ref() {
        return Ok(Arc::clone(context));
    }
    let context = Arc::new(create_device()?);
    *shared = Some(Arc::clone(&context));
    Ok(context)
}

fn create_device() -> Result<GpuContext> {
    let (device, context) = unsafe {
        let mut device = None;
        let mut context = None;

        // SAFETY: out-params are written by D3D11CreateDevice on success.
        D3D11CreateDevice(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            HMODULE::default(),
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            Some(&[D3D_FEATURE_LEVEL_11_1, D3D_FEATURE_LEVEL_11_0]),
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
        .map_err(|e| CaptureError::from_win32(ErrorKind::GpuInitFailed, "D3D11CreateDevice failed", e))?;

        let device = device.ok_or_else(|| {
            CaptureError::new(ErrorKind::GpuInitFailed, "D3D11CreateDevice returned no device")
        })?;
        let context = context.ok_or_else(|| {
            CaptureError::new(ErrorKind::GpuInitFailed, "D3D11CreateDevice returned no context")
        })?;
        (device, context)
    };

    let dxgi_device: IDXGIDevice = device.cast().map_err(|e| {
        CaptureError::from_win32(ErrorKind::GpuInitFailed, "device does not expose IDXGIDevice", e)
    })?;

    // The engine worker copies frames on the immediate context while host
    // threads map staging textures from it; both paths require multithread
    // protection.
    let multithread: ID3D11Multithread = context.cast().map_err(|e| {
        CaptureError::from_win32(
            ErrorKind::GpuInitFailed,
            "device context does not expose ID3D11Multithread",
            e,
        )
    })?;
    // SAFETY: interface obtained from the live context above.
    unsafe {
        multithread.SetMultithreadProtected(true);
    }

    Ok(GpuContext {
        device,
        context,
        dxgi_device,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires a hardware Direct3D 11 device"]
    fn initialize_is_idempotent() {
        initialize().expect("device creation failed");
        initialize().expect("second initialize failed");

        let a = acquire().unwrap();
        let b = acquire().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        finalize();
        // A fresh acquire after finalize builds a new device.
        let c = acquire().unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        finalize();
    }
}
