//! Wayland backend: wlr-screencopy v3 into linux-dmabuf v4 buffers.

use std::fmt;
use std::os::fd::AsFd;

use wayland_client::protocol::wl_buffer::WlBuffer;
use wayland_client::protocol::wl_output::{self, WlOutput};
use wayland_client::protocol::wl_registry::{self, WlRegistry};
use wayland_client::{
    delegate_noop, event_created_child, Connection, Dispatch, EventQueue, QueueHandle, WEnum,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_buffer_params_v1::{
    self, ZwpLinuxBufferParamsV1,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1;
use wayland_protocols::xdg::xdg_output::zv1::client::zxdg_output_manager_v1::ZxdgOutputManagerV1;
use wayland_protocols::xdg::xdg_output::zv1::client::zxdg_output_v1::{self, ZxdgOutputV1};
use wayland_protocols_wlr::screencopy::v1::client::zwlr_screencopy_frame_v1::{
    self, ZwlrScreencopyFrameV1,
};
use wayland_protocols_wlr::screencopy::v1::client::zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1;
use wl_targets::bounds::{LogicalBounds, LogicalPosition, LogicalSize, PhysicalSize};
use wl_targets::{select_output, OutputId, OutputInfo};

use super::drive::EventPump;
use super::frame::{ready_timestamp, DamageRect, DmabufOffer, FrameEvents, FrameOutcome};
use super::{
    require_version, Compositor, LINUX_DMABUF_VERSION, SCREENCOPY_VERSION, WL_OUTPUT_VERSION,
    XDG_OUTPUT_VERSION,
};
use crate::bridge::PlaneExport;
use crate::error::{CaptureError, CaptureResult};
use crate::format::FrameFormat;

const WL_OUTPUT: &str = "wl_output";
const SCREENCOPY_MANAGER: &str = "zwlr_screencopy_manager_v1";
const LINUX_DMABUF: &str = "zwp_linux_dmabuf_v1";
const XDG_OUTPUT_MANAGER: &str = "zxdg_output_manager_v1";

fn dispatch_error(err: impl fmt::Display) -> CaptureError {
    CaptureError::Dispatch(err.to_string())
}

fn handshake_error(err: impl fmt::Display) -> CaptureError {
    CaptureError::Handshake(err.to_string())
}

fn missing_output() -> CaptureError {
    CaptureError::MissingProtocol {
        interface: WL_OUTPUT,
        required: WL_OUTPUT_VERSION,
        offered: "none".to_string(),
    }
}

#[derive(Debug, Clone)]
struct Global {
    name: u32,
    interface: String,
    version: u32,
}

struct BoundOutput {
    output: WlOutput,
    xdg: Option<ZxdgOutputV1>,
    info: OutputInfo,
}

/// Event-side state, mutated only by the queue's dispatch.
#[derive(Default)]
pub struct WaylandState {
    globals: Vec<Global>,
    outputs: Vec<BoundOutput>,
    xdg_manager: Option<ZxdgOutputManagerV1>,
    frame: FrameEvents,
    params_failed: bool,
}

impl WaylandState {
    fn global(&self, interface: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.interface == interface)
    }
}

/// Live connection. Field order is teardown order.
struct WaylandConnection {
    frame: Option<ZwlrScreencopyFrameV1>,
    screencopy: Option<ZwlrScreencopyManagerV1>,
    dmabuf: Option<ZwpLinuxDmabufV1>,
    target: Option<WlOutput>,
    state: WaylandState,
    queue: EventQueue<WaylandState>,
    qh: QueueHandle<WaylandState>,
    registry: WlRegistry,
    connection: Connection,
}

impl WaylandConnection {
    fn open() -> CaptureResult<Self> {
        let connection =
            Connection::connect_to_env().map_err(|e| CaptureError::Connect(e.to_string()))?;
        let mut queue = connection.new_event_queue();
        let qh = queue.handle();
        let registry = connection.display().get_registry(&qh, ());

        let mut state = WaylandState::default();
        queue.roundtrip(&mut state).map_err(handshake_error)?;
        log::debug!("[SESSION] Registry lists {} globals", state.globals.len());

        Ok(Self {
            frame: None,
            screencopy: None,
            dmabuf: None,
            target: None,
            state,
            queue,
            qh,
            registry,
            connection,
        })
    }

    fn roundtrip(&mut self) -> CaptureResult<()> {
        self.queue
            .roundtrip(&mut self.state)
            .map(|_| ())
            .map_err(handshake_error)
    }

    /// Bind `wl_output` globals (all of them, or only the first) plus their
    /// xdg-output objects, then collect metadata in one roundtrip.
    fn bind_outputs(&mut self, all: bool) -> CaptureResult<()> {
        if !self.state.outputs.is_empty() && (!all || self.outputs_complete()) {
            return Ok(());
        }

        let candidates: Vec<Global> = self
            .state
            .globals
            .iter()
            .filter(|g| g.interface == WL_OUTPUT)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(missing_output());
        }

        if self.state.xdg_manager.is_none() {
            if let Some(global) = self.state.global(XDG_OUTPUT_MANAGER).cloned() {
                if global.version >= XDG_OUTPUT_VERSION {
                    let manager: ZxdgOutputManagerV1 =
                        self.registry
                            .bind(global.name, XDG_OUTPUT_VERSION, &self.qh, ());
                    self.state.xdg_manager = Some(manager);
                }
            }
        }

        let mut last_error = None;
        for global in candidates {
            if self
                .state
                .outputs
                .iter()
                .any(|o| o.info.id == Some(OutputId::new(global.name)))
            {
                continue;
            }
            let version = match require_version(WL_OUTPUT, Some(global.version), WL_OUTPUT_VERSION)
            {
                Ok(v) => v,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };

            let index = self.state.outputs.len();
            let output: WlOutput = self.registry.bind(global.name, version, &self.qh, index);
            let xdg = self
                .state
                .xdg_manager
                .as_ref()
                .map(|m| m.get_xdg_output(&output, &self.qh, index));
            self.state.outputs.push(BoundOutput {
                output,
                xdg,
                info: OutputInfo::new(OutputId::new(global.name)),
            });
            if !all {
                break;
            }
        }

        if self.state.outputs.is_empty() {
            return Err(last_error.unwrap_or_else(missing_output));
        }

        self.roundtrip()
    }

    fn outputs_complete(&self) -> bool {
        let offered = self
            .state
            .globals
            .iter()
            .filter(|g| g.interface == WL_OUTPUT && g.version >= WL_OUTPUT_VERSION)
            .count();
        self.state.outputs.len() >= offered
    }

    fn output_infos(&self) -> Vec<OutputInfo> {
        self.state.outputs.iter().map(|o| o.info.clone()).collect()
    }
}

impl Drop for WaylandConnection {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            frame.destroy();
        }
        if let Some(screencopy) = self.screencopy.take() {
            screencopy.destroy();
        }
        if let Some(dmabuf) = self.dmabuf.take() {
            dmabuf.destroy();
        }
        for output in self.state.outputs.drain(..) {
            if let Some(xdg) = output.xdg {
                xdg.destroy();
            }
        }
        if let Some(manager) = self.state.xdg_manager.take() {
            manager.destroy();
        }
        let _ = self.connection.flush();
        log::debug!("[SESSION] Released protocol objects and connection");
    }
}

/// Compositor-side `wl_buffer` over the shared dmabuf. Destroyed on drop.
pub struct WaylandBuffer {
    buffer: WlBuffer,
}

impl Drop for WaylandBuffer {
    fn drop(&mut self) {
        self.buffer.destroy();
    }
}

/// Screencopy client over a Wayland connection.
#[derive(Default)]
pub struct WaylandCompositor {
    conn: Option<WaylandConnection>,
}

impl WaylandCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    fn conn(&mut self) -> CaptureResult<&mut WaylandConnection> {
        self.conn.as_mut().ok_or(CaptureError::NotInitialized)
    }
}

impl EventPump for WaylandCompositor {
    fn dispatch_blocking(&mut self) -> CaptureResult<usize> {
        let conn = self.conn()?;
        conn.queue
            .blocking_dispatch(&mut conn.state)
            .map_err(dispatch_error)
    }
}

impl Compositor for WaylandCompositor {
    type Buffer = WaylandBuffer;

    fn connect(&mut self) -> CaptureResult<()> {
        if self.conn.is_none() {
            self.conn = Some(WaylandConnection::open()?);
        }
        Ok(())
    }

    fn list_outputs(&mut self) -> CaptureResult<Vec<OutputInfo>> {
        let conn = self.conn()?;
        conn.bind_outputs(true)?;
        Ok(conn.output_infos())
    }

    fn discover(&mut self, output: Option<&str>) -> CaptureResult<OutputInfo> {
        let conn = self.conn()?;

        let screencopy = conn.state.global(SCREENCOPY_MANAGER).cloned();
        let screencopy_version = require_version(
            SCREENCOPY_MANAGER,
            screencopy.as_ref().map(|g| g.version),
            SCREENCOPY_VERSION,
        )?;
        let dmabuf = conn.state.global(LINUX_DMABUF).cloned();
        let dmabuf_version = require_version(
            LINUX_DMABUF,
            dmabuf.as_ref().map(|g| g.version),
            LINUX_DMABUF_VERSION,
        )?;

        conn.bind_outputs(output.is_some())?;
        let infos = conn.output_infos();
        let selected = select_output(&infos, output)
            .ok_or_else(|| CaptureError::OutputNotFound(output.unwrap_or_default().to_string()))?
            .clone();
        let target = conn
            .state
            .outputs
            .iter()
            .find(|o| o.info.id == selected.id)
            .map(|o| o.output.clone())
            .ok_or_else(|| CaptureError::OutputNotFound(selected.display_name()))?;

        // Both globals were checked above.
        if let (Some(screencopy), Some(dmabuf)) = (screencopy, dmabuf) {
            conn.screencopy = Some(conn.registry.bind(
                screencopy.name,
                screencopy_version,
                &conn.qh,
                (),
            ));
            conn.dmabuf = Some(conn.registry.bind(dmabuf.name, dmabuf_version, &conn.qh, ()));
        }
        conn.target = Some(target);
        Ok(selected)
    }

    fn capture_output(&mut self, overlay_cursor: bool) -> CaptureResult<()> {
        let conn = self.conn()?;
        if let Some(frame) = conn.frame.take() {
            frame.destroy();
        }
        let (Some(screencopy), Some(target)) = (&conn.screencopy, &conn.target) else {
            return Err(CaptureError::NotInitialized);
        };

        conn.state.frame = FrameEvents::default();
        conn.frame = Some(screencopy.capture_output(overlay_cursor as i32, target, &conn.qh, ()));
        Ok(())
    }

    fn frame_events(&self) -> &FrameEvents {
        match &self.conn {
            Some(conn) => &conn.state.frame,
            None => &IDLE_FRAME,
        }
    }

    fn copy(&mut self, buffer: &WaylandBuffer) -> CaptureResult<()> {
        let conn = self.conn()?;
        let frame = conn.frame.as_ref().ok_or(CaptureError::NotInitialized)?;
        frame.copy(&buffer.buffer);
        Ok(())
    }

    fn finish_frame(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            if let Some(frame) = conn.frame.take() {
                frame.destroy();
            }
        }
    }

    fn create_buffer(
        &mut self,
        planes: &[PlaneExport],
        width: u32,
        height: u32,
        format: FrameFormat,
    ) -> CaptureResult<WaylandBuffer> {
        let conn = self.conn()?;
        let dmabuf = conn.dmabuf.as_ref().ok_or(CaptureError::NotInitialized)?;

        let params = dmabuf.create_params(&conn.qh, ());
        let (hi, lo) = format.modifier_halves();
        for (index, plane) in planes.iter().enumerate() {
            params.add(
                plane.fd.as_fd(),
                index as u32,
                plane.offset,
                plane.stride,
                hi,
                lo,
            );
        }
        conn.state.params_failed = false;
        let buffer = params.create_immed(
            width as i32,
            height as i32,
            format.fourcc,
            zwp_linux_buffer_params_v1::Flags::empty(),
            &conn.qh,
            (),
        );
        let buffer = WaylandBuffer { buffer };

        let sync = conn.roundtrip();
        params.destroy();
        if let Err(e) = sync {
            return Err(CaptureError::ImportFailed(format!(
                "compositor rejected dmabuf {}: {}",
                format, e
            )));
        }
        if conn.state.params_failed {
            return Err(CaptureError::ImportFailed(format!(
                "compositor failed buffer params for {}x{} {}",
                width, height, format
            )));
        }

        log::debug!("[SESSION] Created wl_buffer {}x{} {}", width, height, format);
        Ok(buffer)
    }

    fn disconnect(&mut self) {
        self.conn = None;
    }
}

static IDLE_FRAME: FrameEvents = FrameEvents {
    dmabuf: None,
    shm: None,
    y_inverted: false,
    damage: Vec::new(),
    buffer_done: false,
    outcome: FrameOutcome::Pending,
};

impl Dispatch<WlRegistry, ()> for WaylandState {
    fn event(
        state: &mut Self,
        _: &WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => {
                state.globals.push(Global {
                    name,
                    interface,
                    version,
                });
            }
            wl_registry::Event::GlobalRemove { name } => {
                state.globals.retain(|g| g.name != name);
            }
            _ => {}
        }
    }
}

impl Dispatch<WlOutput, usize> for WaylandState {
    fn event(
        state: &mut Self,
        _: &WlOutput,
        event: wl_output::Event,
        index: &usize,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(bound) = state.outputs.get_mut(*index) else {
            return;
        };
        let info = &mut bound.info;
        match event {
            wl_output::Event::Geometry { make, model, .. } => {
                info.make = make;
                info.model = model;
            }
            wl_output::Event::Mode {
                flags,
                width,
                height,
                refresh,
            } => {
                if let WEnum::Value(bits) = flags {
                    if bits.contains(wl_output::Mode::Current) {
                        info.mode = PhysicalSize::new(width.max(0) as u32, height.max(0) as u32);
                        info.refresh_mhz = refresh;
                    }
                }
            }
            wl_output::Event::Scale { factor } => info.scale = factor,
            wl_output::Event::Name { name } => {
                info.name.get_or_insert(name);
            }
            wl_output::Event::Description { description } => {
                info.description.get_or_insert(description);
            }
            _ => {}
        }
    }
}

impl Dispatch<ZxdgOutputV1, usize> for WaylandState {
    fn event(
        state: &mut Self,
        _: &ZxdgOutputV1,
        event: zxdg_output_v1::Event,
        index: &usize,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(bound) = state.outputs.get_mut(*index) else {
            return;
        };
        let info = &mut bound.info;
        match event {
            zxdg_output_v1::Event::LogicalPosition { x, y } => {
                let bounds = info.logical.get_or_insert_with(LogicalBounds::default);
                bounds.position = LogicalPosition::new(x, y);
            }
            zxdg_output_v1::Event::LogicalSize { width, height } => {
                let bounds = info.logical.get_or_insert_with(LogicalBounds::default);
                bounds.size = LogicalSize::new(width, height);
            }
            zxdg_output_v1::Event::Name { name } => info.name = Some(name),
            zxdg_output_v1::Event::Description { description } => {
                info.description = Some(description)
            }
            _ => {}
        }
    }
}

impl Dispatch<ZwlrScreencopyFrameV1, ()> for WaylandState {
    fn event(
        state: &mut Self,
        _: &ZwlrScreencopyFrameV1,
        event: zwlr_screencopy_frame_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let frame = &mut state.frame;
        match event {
            zwlr_screencopy_frame_v1::Event::Buffer {
                width,
                height,
                stride,
                ..
            } => {
                frame.shm = Some((width, height, stride));
            }
            zwlr_screencopy_frame_v1::Event::LinuxDmabuf {
                format,
                width,
                height,
            } => {
                frame.dmabuf = Some(DmabufOffer {
                    format,
                    width,
                    height,
                });
            }
            zwlr_screencopy_frame_v1::Event::BufferDone => frame.buffer_done = true,
            zwlr_screencopy_frame_v1::Event::Flags { flags } => {
                if let WEnum::Value(flags) = flags {
                    frame.y_inverted = flags.contains(zwlr_screencopy_frame_v1::Flags::YInvert);
                }
            }
            zwlr_screencopy_frame_v1::Event::Damage {
                x,
                y,
                width,
                height,
            } => {
                frame.damage.push(DamageRect {
                    x,
                    y,
                    width,
                    height,
                });
            }
            zwlr_screencopy_frame_v1::Event::Ready {
                tv_sec_hi,
                tv_sec_lo,
                tv_nsec,
            } => {
                frame.outcome = FrameOutcome::Ready {
                    presented_at: ready_timestamp(tv_sec_hi, tv_sec_lo, tv_nsec),
                };
            }
            zwlr_screencopy_frame_v1::Event::Failed => frame.outcome = FrameOutcome::Failed,
            _ => {}
        }
    }
}

impl Dispatch<ZwpLinuxBufferParamsV1, ()> for WaylandState {
    fn event(
        state: &mut Self,
        _: &ZwpLinuxBufferParamsV1,
        event: zwp_linux_buffer_params_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let zwp_linux_buffer_params_v1::Event::Failed = event {
            state.params_failed = true;
        }
    }

    event_created_child!(WaylandState, ZwpLinuxBufferParamsV1, [
        zwp_linux_buffer_params_v1::EVT_CREATED_OPCODE => (WlBuffer, ()),
    ]);
}

delegate_noop!(WaylandState: ignore WlBuffer);
delegate_noop!(WaylandState: ignore ZwpLinuxDmabufV1);
delegate_noop!(WaylandState: ignore ZwlrScreencopyManagerV1);
delegate_noop!(WaylandState: ignore ZxdgOutputManagerV1);
