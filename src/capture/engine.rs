// WGC capture engine: one single-threaded COM apartment per stream.
//
// The worker thread is the apartment. Every WGC object is created, serviced
// and torn down on it; other components never call WGC directly. Frames
// arriving from the pool are copied into engine-owned textures and
// published to the ring after all WGC calls complete, so no engine lock is
// ever held across a WGC call. Failures are parked in the stream's error
// channel; the handler never unwinds into COM dispatch.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use windows::core::{IInspectable, Interface, HSTRING};
use windows::Foundation::Metadata::ApiInformation;
use windows::Foundation::{AsyncActionCompletedHandler, IClosable, TypedEventHandler};
use windows::Graphics::Capture::{
    Direct3D11CaptureFrame, Direct3D11CaptureFramePool, GraphicsCaptureItem,
    GraphicsCaptureSession,
};
use windows::Graphics::DirectX::Direct3D11::IDirect3DDevice;
use windows::Graphics::DirectX::DirectXPixelFormat;
use windows::Graphics::SizeInt32;
use windows::System::DispatcherQueueController;
use windows::Win32::Foundation::{CloseHandle, HANDLE, HWND, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Texture2D, D3D11_BIND_SHADER_RESOURCE, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT,
};
use windows::Win32::Graphics::Gdi::HMONITOR;
use windows::Win32::System::Threading::{CreateEventW, SetEvent, WaitForSingleObject, INFINITE};
use windows::Win32::System::WinRT::Direct3D11::{
    CreateDirect3D11DeviceFromDXGIDevice, IDirect3DDxgiInterfaceAccess,
};
use windows::Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop;
use windows::Win32::System::WinRT::{
    CreateDispatcherQueueController, DispatcherQueueOptions, RoInitialize, RoUninitialize,
    DQTAT_COM_STA, DQTYPE_THREAD_CURRENT, RO_INIT_SINGLETHREADED,
};
use windows::Win32::UI::WindowsAndMessaging::{
    DispatchMessageW, MsgWaitForMultipleObjects, PeekMessageW, TranslateMessage, MSG, PM_REMOVE,
    QS_ALLINPUT, WM_QUIT,
};

use super::options::{optimal_frame_size, ring_capacity, CaptureOptions};
use super::ring::{FrameRecord, FrameRing};
use crate::d3d11::rescale::TextureRescaler;
use crate::d3d11::GpuContext;
use crate::error::{CaptureError, ErrorChannel, ErrorKind, Result};

/// Frame pool back-buffer count.
const FRAME_POOL_BUFFERS: i32 = 3;

/// Windows.Foundation.UniversalApiContract major version floor
/// (Windows 10 1809, build 17763).
const CONTRACT_FLOOR: u16 = 8;

const SESSION_TYPE_NAME: &str = "Windows.Graphics.Capture.GraphicsCaptureSession";

/// Capture target, kept as a pointer-sized integer so it can cross into the
/// worker thread.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RawTarget {
    Window(isize),
    Monitor(isize),
}

impl RawTarget {
    pub fn handle_value(self) -> isize {
        match self {
            RawTarget::Window(handle) | RawTarget::Monitor(handle) => handle,
        }
    }
}

/// State shared between the stream facade and its engine worker.
pub(crate) struct StreamShared {
    pub ring: FrameRing,
    pub errors: ErrorChannel,
    pub stop: StopEvent,
}

/// Manual-reset kernel event signalling the worker to exit.
pub(crate) struct StopEvent(HANDLE);

// SAFETY: kernel event handles may be waited on and signalled from any
// thread; the wrapper owns the handle until drop.
unsafe impl Send for StopEvent {}
unsafe impl Sync for StopEvent {}

impl StopEvent {
    pub fn new() -> Result<Self> {
        // SAFETY: anonymous manual-reset event, initially non-signalled.
        let handle = unsafe { CreateEventW(None, true, false, None) }.map_err(|e| {
            CaptureError::from_win32(
                ErrorKind::InternalInvariantViolated,
                "failed to create the stop event",
                e,
            )
        })?;
        Ok(Self(handle))
    }

    pub fn signal(&self) {
        // SAFETY: the handle stays valid for the stream's lifetime.
        if let Err(e) = unsafe { SetEvent(self.0) } {
            log::warn!("failed to signal the stop event: {e}");
        }
    }

    fn handle(&self) -> HANDLE {
        self.0
    }
}

impl Drop for StopEvent {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            // SAFETY: handle owned by this wrapper, closed exactly once.
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

/// Spawn the engine worker and wait for its initialization verdict.
///
/// On `Ok` the worker is capturing; any later failure lands in the shared
/// error channel. On `Err` the worker has already terminated.
pub(crate) fn spawn(
    gpu: Arc<GpuContext>,
    shared: Arc<StreamShared>,
    target: RawTarget,
    options: CaptureOptions,
) -> Result<JoinHandle<()>> {
    let (init_tx, init_rx) = mpsc::channel::<Result<()>>();

    let handle = thread::Builder::new()
        .name("replaycap-engine".into())
        .spawn(move || worker_main(gpu, shared, target, options, init_tx))
        .map_err(|e| {
            CaptureError::new(
                ErrorKind::InternalInvariantViolated,
                format!("failed to spawn the engine worker: {e}"),
            )
        })?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(error)) => {
            let _ = handle.join();
            Err(error)
        }
        Err(_) => {
            let _ = handle.join();
            Err(CaptureError::new(
                ErrorKind::InternalInvariantViolated,
                "engine worker exited before initialization",
            ))
        }
    }
}

fn worker_main(
    gpu: Arc<GpuContext>,
    shared: Arc<StreamShared>,
    target: RawTarget,
    options: CaptureOptions,
    init_tx: mpsc::Sender<Result<()>>,
) {
    let _apartment = match ApartmentGuard::enter() {
        Ok(guard) => guard,
        Err(error) => {
            let _ = init_tx.send(Err(error));
            return;
        }
    };

    let mut engine = match Engine::initialize(&gpu, &shared, target, &options) {
        Ok(engine) => {
            let _ = init_tx.send(Ok(()));
            engine
        }
        Err(error) => {
            let _ = init_tx.send(Err(error));
            return;
        }
    };

    if let Err(error) = engine.run(&shared) {
        shared.errors.throw_in(error);
    }

    engine.shutdown();
}

/// Single-threaded apartment for the lifetime of the worker.
struct ApartmentGuard;

impl ApartmentGuard {
    fn enter() -> Result<Self> {
        // SAFETY: paired with RoUninitialize in Drop, on the same thread.
        unsafe { RoInitialize(RO_INIT_SINGLETHREADED) }.map_err(|e| {
            CaptureError::from_win32(
                ErrorKind::PlatformUnsupported,
                "failed to initialize the WinRT apartment",
                e,
            )
        })?;
        Ok(Self)
    }
}

impl Drop for ApartmentGuard {
    fn drop(&mut self) {
        // SAFETY: paired with the RoInitialize in `enter`.
        unsafe { RoUninitialize() };
    }
}

struct Engine {
    controller: Option<DispatcherQueueController>,
    wgc_device: Option<IDirect3DDevice>,
    frame_pool: Option<Direct3D11CaptureFramePool>,
    session: Option<GraphicsCaptureSession>,
    frame_arrived_token: i64,
    stop_handle: HANDLE,
    shut_down: bool,
}

impl Engine {
    /// Bring up the full WGC object graph on the apartment thread and start
    /// capturing.
    fn initialize(
        gpu: &Arc<GpuContext>,
        shared: &Arc<StreamShared>,
        target: RawTarget,
        options: &CaptureOptions,
    ) -> Result<Self> {
        probe_platform()?;

        let queue_options = DispatcherQueueOptions {
            dwSize: std::mem::size_of::<DispatcherQueueOptions>() as u32,
            threadType: DQTYPE_THREAD_CURRENT,
            apartmentType: DQTAT_COM_STA,
        };
        // SAFETY: options fully initialized; binds the queue to this thread.
        let controller = unsafe { CreateDispatcherQueueController(queue_options) }.map_err(|e| {
            CaptureError::from_win32(
                ErrorKind::PlatformUnsupported,
                "failed to create the dispatcher queue controller",
                e,
            )
        })?;

        // SAFETY: the DXGI device comes from the live shared D3D11 device.
        let wgc_device: IDirect3DDevice =
            unsafe { CreateDirect3D11DeviceFromDXGIDevice(&gpu.dxgi_device) }
                .map_err(|e| {
                    CaptureError::from_win32(
                        ErrorKind::GpuInitFailed,
                        "failed to wrap the D3D11 device for capture",
                        e,
                    )
                })?
                .cast()
                .map_err(|e| {
                    CaptureError::from_win32(
                        ErrorKind::GpuInitFailed,
                        "device wrapper lacks IDirect3DDevice",
                        e,
                    )
                })?;

        let item = create_capture_item(target)?;
        let content_size = clamp_size(item.Size().map_err(|e| {
            CaptureError::from_win32(ErrorKind::TargetInvalid, "capture item refused its size", e)
        })?);

        // Size the ring for the initial (possibly capped) frame geometry.
        let (stored_width, stored_height) = optimal_frame_size(
            content_size.Width as u32,
            content_size.Height as u32,
            options.max_width,
            options.max_height,
        );
        shared
            .ring
            .resize(ring_capacity(options, stored_width, stored_height))?;

        let frame_pool = Direct3D11CaptureFramePool::Create(
            &wgc_device,
            DirectXPixelFormat::B8G8R8A8UIntNormalized,
            FRAME_POOL_BUFFERS,
            content_size,
        )
        .map_err(|e| {
            CaptureError::from_win32(
                ErrorKind::PlatformUnsupported,
                "failed to create the frame pool",
                e,
            )
        })?;

        let session = frame_pool.CreateCaptureSession(&item).map_err(|e| {
            CaptureError::from_win32(
                ErrorKind::TargetInvalid,
                "failed to create the capture session",
                e,
            )
        })?;
        configure_session(&session, options);

        let handler = Arc::new(FrameHandler {
            gpu: Arc::clone(gpu),
            shared: Arc::clone(shared),
            wgc_device: wgc_device.clone(),
            options: options.clone(),
            content_size: Mutex::new(content_size),
            rescaler: Mutex::new(None),
        });
        let frame_arrived_token = frame_pool
            .FrameArrived(&TypedEventHandler::<
                Direct3D11CaptureFramePool,
                IInspectable,
            >::new(move |sender, _| {
                if let Some(pool) = sender.as_ref() {
                    if let Err(error) = handler.on_frame_arrived(pool) {
                        handler.shared.errors.throw_in(error);
                    }
                }
                Ok(())
            }))
            .map_err(|e| {
                CaptureError::from_win32(
                    ErrorKind::PlatformUnsupported,
                    "failed to register the frame-arrived handler",
                    e,
                )
            })?;

        session.StartCapture().map_err(|e| {
            CaptureError::from_win32(ErrorKind::TargetInvalid, "failed to start capture", e)
        })?;
        log::debug!(
            "capture engine started for {target:?} at {}x{}",
            content_size.Width,
            content_size.Height
        );

        Ok(Self {
            controller: Some(controller),
            wgc_device: Some(wgc_device),
            frame_pool: Some(frame_pool),
            session: Some(session),
            frame_arrived_token,
            stop_handle: shared.stop.handle(),
            shut_down: false,
        })
    }

    /// Message loop: wait on the stop event or queued messages. A parked
    /// engine error also ends the loop; the error stays queued for the
    /// host to drain.
    fn run(&mut self, shared: &StreamShared) -> Result<()> {
        loop {
            // SAFETY: the stop handle is valid for the stream's lifetime.
            let wait = unsafe {
                MsgWaitForMultipleObjects(Some(&[self.stop_handle]), false, INFINITE, QS_ALLINPUT)
            };
            if wait == WAIT_OBJECT_0 {
                return Ok(());
            } else if wait.0 == WAIT_OBJECT_0.0 + 1 {
                if pump_messages() == PumpOutcome::Quit {
                    return Ok(());
                }
            } else {
                return Err(CaptureError::new(
                    ErrorKind::InternalInvariantViolated,
                    "MsgWaitForMultipleObjects failed in the engine loop",
                )
                .with_context("wait", format!("{:#X}", wait.0)));
            }

            if shared.errors.has_pending() {
                return Ok(());
            }
        }
    }

    /// Orderly teardown on the apartment thread. Every step is best-effort:
    /// failures are logged and never propagate.
    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Some(pool) = self.frame_pool.as_ref() {
            if let Err(e) = pool.RemoveFrameArrived(self.frame_arrived_token) {
                log::warn!("failed to revoke the frame-arrived handler: {e}");
            }
        }
        if let Some(session) = self.session.take() {
            if let Err(e) = session.Close() {
                log::warn!("failed to close the capture session: {e}");
            }
        }
        if let Some(pool) = self.frame_pool.take() {
            if let Err(e) = pool.Close() {
                log::warn!("failed to close the frame pool: {e}");
            }
        }
        if let Some(controller) = self.controller.take() {
            shutdown_dispatcher_queue(controller);
        }
        if let Some(device) = self.wgc_device.take() {
            match device.cast::<IClosable>() {
                Ok(closable) => {
                    if let Err(e) = closable.Close() {
                        log::warn!("failed to close the capture device wrapper: {e}");
                    }
                }
                Err(e) => log::warn!("capture device wrapper is not closable: {e}"),
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Platform support probe, run before any WGC object is created.
fn probe_platform() -> Result<()> {
    let contract = HSTRING::from("Windows.Foundation.UniversalApiContract");
    let contract_present =
        ApiInformation::IsApiContractPresentByMajor(&contract, CONTRACT_FLOOR).unwrap_or(false);
    if !contract_present {
        return Err(CaptureError::new(
            ErrorKind::PlatformUnsupported,
            "OS build is below the supported floor",
        )
        .with_context("contract", format!("UniversalApiContract v{CONTRACT_FLOOR}")));
    }

    let supported = GraphicsCaptureSession::IsSupported().map_err(|e| {
        CaptureError::from_win32(
            ErrorKind::PlatformUnsupported,
            "failed to query graphics capture support",
            e,
        )
    })?;
    if !supported {
        return Err(CaptureError::new(
            ErrorKind::PlatformUnsupported,
            "graphics capture is not supported on this system",
        ));
    }

    windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>().map_err(|e| {
        CaptureError::from_win32(
            ErrorKind::PlatformUnsupported,
            "capture item interop factory is unavailable",
            e,
        )
    })?;

    Ok(())
}

fn create_capture_item(target: RawTarget) -> Result<GraphicsCaptureItem> {
    let interop: IGraphicsCaptureItemInterop =
        windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>().map_err(
            |e| {
                CaptureError::from_win32(
                    ErrorKind::PlatformUnsupported,
                    "capture item interop factory is unavailable",
                    e,
                )
            },
        )?;

    // SAFETY: interop factory call; the handle values come from the host
    // and are validated by WGC itself.
    let item = unsafe {
        match target {
            RawTarget::Window(handle) => interop.CreateForWindow(HWND(handle as *mut _)),
            RawTarget::Monitor(handle) => interop.CreateForMonitor(HMONITOR(handle as *mut _)),
        }
    }
    .map_err(|e| {
        CaptureError::from_win32(ErrorKind::TargetInvalid, "target handle was refused", e)
    })?;

    Ok(item)
}

/// Apply session settings. Each setter is guarded by a capability probe;
/// capabilities absent on this OS build are skipped.
fn configure_session(session: &GraphicsCaptureSession, options: &CaptureOptions) {
    set_session_property(
        "IsCursorCaptureEnabled",
        || session.SetIsCursorCaptureEnabled(options.include_cursor),
    );
    set_session_property(
        "IsBorderRequired",
        || session.SetIsBorderRequired(options.border_required),
    );
    set_session_property(
        "IncludeSecondaryWindows",
        || session.SetIncludeSecondaryWindows(false),
    );
}

fn set_session_property(name: &str, set: impl FnOnce() -> windows::core::Result<()>) {
    let present = ApiInformation::IsPropertyPresent(
        &HSTRING::from(SESSION_TYPE_NAME),
        &HSTRING::from(name),
    )
    .unwrap_or(false);
    if !present {
        log::debug!("capture session property {name} not present; skipped");
        return;
    }
    if let Err(e) = set() {
        log::warn!("failed to set capture session property {name}: {e}");
    }
}

fn clamp_size(size: SizeInt32) -> SizeInt32 {
    SizeInt32 {
        Width: size.Width.max(1),
        Height: size.Height.max(1),
    }
}

/// Per-stream state owned by the frame-arrived callback.
struct FrameHandler {
    gpu: Arc<GpuContext>,
    shared: Arc<StreamShared>,
    wgc_device: IDirect3DDevice,
    options: CaptureOptions,
    /// Content size the frame pool is currently sized for.
    content_size: Mutex<SizeInt32>,
    /// Lazily built rescale pass; only needed once size caps bite.
    rescaler: Mutex<Option<TextureRescaler>>,
}

impl FrameHandler {
    fn on_frame_arrived(&self, pool: &Direct3D11CaptureFramePool) -> Result<()> {
        // Keep only the most recent frame. The ring is a time window, not a
        // stream; dropping intermediate frames is the backpressure policy.
        let mut frame: Option<Direct3D11CaptureFrame> = None;
        while let Ok(next) = pool.TryGetNextFrame() {
            frame = Some(next);
        }
        let Some(frame) = frame else {
            return Ok(());
        };

        let content_size = clamp_size(frame.ContentSize().map_err(|e| {
            CaptureError::from_win32(
                ErrorKind::InternalInvariantViolated,
                "frame refused its content size",
                e,
            )
        })?);

        {
            let mut cached = self
                .content_size
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if content_size.Width != cached.Width || content_size.Height != cached.Height {
                // Dynamic resize: recreate the pool at the new size and
                // restart the ring, which must not mix geometries.
                pool.Recreate(
                    &self.wgc_device,
                    DirectXPixelFormat::B8G8R8A8UIntNormalized,
                    FRAME_POOL_BUFFERS,
                    content_size,
                )
                .map_err(|e| {
                    CaptureError::from_win32(
                        ErrorKind::GpuInitFailed,
                        "failed to recreate the frame pool after a resize",
                        e,
                    )
                })?;
                *cached = content_size;

                let (stored_width, stored_height) = optimal_frame_size(
                    content_size.Width as u32,
                    content_size.Height as u32,
                    self.options.max_width,
                    self.options.max_height,
                );
                self.shared
                    .ring
                    .resize(ring_capacity(&self.options, stored_width, stored_height))?;
                log::debug!(
                    "content resized to {}x{}; ring restarted",
                    content_size.Width,
                    content_size.Height
                );
            }
        }

        let source = frame_texture(&frame)?;
        let mut source_desc = D3D11_TEXTURE2D_DESC::default();
        // SAFETY: GetDesc writes the descriptor of a live texture.
        unsafe { source.GetDesc(&mut source_desc) };

        let (target_width, target_height) = optimal_frame_size(
            source_desc.Width,
            source_desc.Height,
            self.options.max_width,
            self.options.max_height,
        );
        let texture = if (target_width, target_height) == (source_desc.Width, source_desc.Height) {
            self.copy_frame_texture(&source, &source_desc)?
        } else {
            self.rescale_frame_texture(&source, target_width, target_height)?
        };

        let timestamp = frame
            .SystemRelativeTime()
            .map_err(|e| {
                CaptureError::from_win32(
                    ErrorKind::InternalInvariantViolated,
                    "frame refused its timestamp",
                    e,
                )
            })?
            .Duration;

        // All WGC calls are done; only now is the ring lock taken.
        let record = Arc::new(FrameRecord {
            texture,
            timestamp,
            width: target_width,
            height: target_height,
        });
        self.shared.ring.push(record, timestamp)
    }

    /// Same-size path: allocate a sibling DEFAULT texture and copy into it.
    fn copy_frame_texture(
        &self,
        source: &ID3D11Texture2D,
        source_desc: &D3D11_TEXTURE2D_DESC,
    ) -> Result<ID3D11Texture2D> {
        let copy_desc = D3D11_TEXTURE2D_DESC {
            MipLevels: 1,
            ArraySize: 1,
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_SHADER_RESOURCE.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
            ..*source_desc
        };

        // SAFETY: descriptor fully initialized; the out-param is written on
        // success and the copy targets two live resources of equal size.
        unsafe {
            let mut copy = None;
            self.gpu
                .device
                .CreateTexture2D(&copy_desc, None, Some(&mut copy))
                .map_err(|e| {
                    CaptureError::from_win32(
                        ErrorKind::GpuInitFailed,
                        "failed to allocate a frame copy texture",
                        e,
                    )
                })?;
            let copy = copy.ok_or_else(|| {
                CaptureError::new(ErrorKind::GpuInitFailed, "CreateTexture2D returned nothing")
            })?;
            self.gpu.context.CopyResource(&copy, source);
            Ok(copy)
        }
    }

    /// Capped path: delegate to the rescale pass, building it on first use.
    fn rescale_frame_texture(
        &self,
        source: &ID3D11Texture2D,
        width: u32,
        height: u32,
    ) -> Result<ID3D11Texture2D> {
        let mut guard = self.rescaler.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(TextureRescaler::new(&self.gpu)?);
        }
        match guard.as_ref() {
            Some(rescaler) => rescaler.rescale(&self.gpu, source, width, height),
            None => Err(CaptureError::new(
                ErrorKind::InternalInvariantViolated,
                "rescaler missing after initialization",
            )),
        }
    }
}

/// Extract the backing D3D11 texture from a capture frame.
fn frame_texture(frame: &Direct3D11CaptureFrame) -> Result<ID3D11Texture2D> {
    let surface = frame.Surface().map_err(|e| {
        CaptureError::from_win32(
            ErrorKind::InternalInvariantViolated,
            "frame carries no surface",
            e,
        )
    })?;
    let access: IDirect3DDxgiInterfaceAccess = surface.cast().map_err(|e| {
        CaptureError::from_win32(
            ErrorKind::InternalInvariantViolated,
            "surface lacks DXGI interface access",
            e,
        )
    })?;
    // SAFETY: interop access obtained from a live surface.
    unsafe { access.GetInterface::<ID3D11Texture2D>() }.map_err(|e| {
        CaptureError::from_win32(
            ErrorKind::InternalInvariantViolated,
            "surface has no ID3D11Texture2D",
            e,
        )
    })
}

#[derive(PartialEq)]
enum PumpOutcome {
    Drained,
    Quit,
}

/// Drain the thread message queue; dispatcher-queue callbacks (including
/// frame-arrived delivery) run from here.
fn pump_messages() -> PumpOutcome {
    let mut msg = MSG::default();
    // SAFETY: standard thread message pump; msg is written by PeekMessageW.
    unsafe {
        while PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE).as_bool() {
            if msg.message == WM_QUIT {
                return PumpOutcome::Quit;
            }
            let _ = TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }
    PumpOutcome::Drained
}

/// Shut down the dispatcher queue, pumping messages until its completion
/// callback lands. The completion is delivered as a message, so a plain
/// blocking wait would deadlock.
fn shutdown_dispatcher_queue(controller: DispatcherQueueController) {
    let action = match controller.ShutdownQueueAsync() {
        Ok(action) => action,
        Err(e) => {
            log::warn!("ShutdownQueueAsync failed: {e}");
            return;
        }
    };

    // SAFETY: anonymous manual-reset event, initially non-signalled.
    let done = match unsafe { CreateEventW(None, true, false, None) } {
        Ok(handle) => handle,
        Err(e) => {
            log::warn!("failed to create the shutdown event: {e}");
            return;
        }
    };

    // HANDLE is not Send; smuggle the raw value into the completion handler.
    let done_value = done.0 as usize;
    let completed = AsyncActionCompletedHandler::new(move |_, _| {
        // SAFETY: the handle outlives the wait below, or is owned by the
        // detached waiter on the failure path.
        unsafe {
            let _ = SetEvent(HANDLE(done_value as *mut _));
        }
        Ok(())
    });
    if let Err(e) = action.SetCompleted(&completed) {
        log::warn!("failed to register the shutdown completion handler: {e}");
        // SAFETY: handle created above; nothing else references it.
        unsafe {
            let _ = CloseHandle(done);
        }
        return;
    }

    loop {
        // SAFETY: `done` is a valid event handle created above.
        let wait = unsafe { MsgWaitForMultipleObjects(Some(&[done]), false, INFINITE, QS_ALLINPUT) };
        if wait == WAIT_OBJECT_0 {
            break;
        } else if wait.0 == WAIT_OBJECT_0.0 + 1 {
            // Shutdown must complete even if a WM_QUIT slips in; keep
            // pumping until the completion event fires.
            let _ = pump_messages();
        } else {
            // Wait machinery failed. Hand the event to a detached waiter so
            // a hung queue cannot deadlock close().
            log::warn!("shutdown wait failed; detaching a waiter for the dispatcher queue");
            thread::spawn(move || {
                // SAFETY: the waiter owns the handle from here on.
                unsafe {
                    let handle = HANDLE(done_value as *mut _);
                    let _ = WaitForSingleObject(handle, INFINITE);
                    let _ = CloseHandle(handle);
                }
            });
            return;
        }
    }

    // SAFETY: handle created above, closed exactly once on this path.
    unsafe {
        let _ = CloseHandle(done);
    }
}
