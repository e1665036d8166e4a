use std::sync::Arc;
use std::time::Instant;

use keel_core::cli::EngineArgs;
use keel_core::log::{self, debug, error, info, warn};
use keel_rhi::vulkan::{SwapchainConfig, VulkanBackend};
use keel_rhi::{
    BindingPoint, BufferDesc, BufferHandle, CascadeUniforms, FrameInfo, FrameStatus, GlobalUniforms, ModelUniforms,
    PipelineVariant, RenderDevice, RhiConfig, TextureDesc, TextureFormat, TextureHandle,
};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

const IDENTITY: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

const TRIANGLE: [[f32; 4]; 3] = [
    [0.0, -0.5, 0.0, 1.0],
    [0.5, 0.5, 0.0, 1.0],
    [-0.5, 0.5, 0.0, 1.0],
];

const INSTANCE_COUNT: u32 = 64;
/// Frames between instance buffer replacements.
const INSTANCE_BUFFER_LIFETIME: u64 = 240;

/// GPU resources the sandbox draws with.
struct Scene {
    triangle: BufferHandle,
    instances: BufferHandle,
    checker: TextureHandle,
}

impl Scene {
    fn new(device: &mut RenderDevice<VulkanBackend>) -> anyhow::Result<Self> {
        let triangle = device.create_buffer(&BufferDesc::vertex("triangle", std::mem::size_of_val(&TRIANGLE) as u64));
        if triangle.is_none() {
            anyhow::bail!("failed to create the triangle vertex buffer");
        }
        device.upload_buffer(triangle, bytemuck::cast_slice(&TRIANGLE));

        let checker = device.create_texture(&TextureDesc::new_2d(8, 8, TextureFormat::Rgba8Unorm).with_name("checker"));
        if !checker.is_none() {
            device.update_texture(checker, &checker_texels(8));
        }
        device.set_texture(BindingPoint::ColorTexture, checker);

        Ok(Self {
            triangle,
            instances: create_instance_buffer(device),
            checker,
        })
    }

    fn destroy(self, device: &RenderDevice<VulkanBackend>) {
        device.destroy_buffer(self.triangle);
        device.destroy_buffer(self.instances);
        device.destroy_texture(self.checker);
    }
}

fn create_instance_buffer(device: &RenderDevice<VulkanBackend>) -> BufferHandle {
    let size = INSTANCE_COUNT as u64 * std::mem::size_of::<[f32; 4]>() as u64;
    device.create_buffer(&BufferDesc::instance("instances", size))
}

fn checker_texels(size: u32) -> Vec<u8> {
    (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            if (x + y) % 2 == 0 { [255, 255, 255, 255] } else { [40, 40, 40, 255] }
        })
        .collect()
}

struct Sandbox {
    window: Arc<Window>,
    scene: Option<Scene>,
    device: RenderDevice<VulkanBackend>,
    start: Instant,
    last_tick: Instant,
}

impl Sandbox {
    fn new(window: Arc<Window>, config: RhiConfig) -> anyhow::Result<Self> {
        let backend = VulkanBackend::new(window.clone(), SwapchainConfig::default())?;
        let mut device = RenderDevice::new(backend, config)?;
        let scene = Scene::new(&mut device)?;

        Ok(Self {
            window,
            scene: Some(scene),
            device,
            start: Instant::now(),
            last_tick: Instant::now(),
        })
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.device.resize(width, height);
    }

    /// Record one frame. Returns `false` once the device is unusable.
    #[profiling::function]
    fn render(&mut self) -> bool {
        let info = match self.device.begin_frame() {
            Ok(FrameStatus::Started(info)) => info,
            Ok(FrameStatus::Skipped(reason)) => {
                debug!("frame skipped: {reason:?}");
                return true;
            }
            Ok(FrameStatus::AlreadyInProgress) => return true,
            Err(err) => {
                error!("begin_frame failed: {err}");
                return !err.is_fatal();
            }
        };

        self.recycle_instances(&info);
        self.record(&info);

        if let Err(err) = self.device.end_frame() {
            error!("end_frame failed: {err}");
            return !err.is_fatal();
        }
        true
    }

    /// Replace the instance buffer now and then; the old one stays alive until the frames
    /// using it have finished.
    fn recycle_instances(&mut self, info: &FrameInfo) {
        if info.frame_index == 0 || info.frame_index % INSTANCE_BUFFER_LIFETIME != 0 {
            return;
        }
        let Some(scene) = self.scene.as_mut() else {
            return;
        };
        let replacement = create_instance_buffer(&self.device);
        self.device.destroy_buffer(std::mem::replace(&mut scene.instances, replacement));
        debug!("instance buffer replaced at frame {}", info.frame_index);
    }

    fn record(&mut self, info: &FrameInfo) {
        let now = Instant::now();
        let time = (now - self.start).as_secs_f32();
        let delta = (now - self.last_tick).as_secs_f32();
        self.last_tick = now;

        let (width, height) = (info.extent.width as f32, info.extent.height as f32);
        self.device.set_global_uniforms(&GlobalUniforms {
            view: IDENTITY,
            projection: IDENTITY,
            sun_direction: [0.3, -1.0, 0.2, 0.0],
            sun_color: [1.0, 0.95, 0.9, 1.0],
            ambient_color: [0.1, 0.1, 0.15, 1.0],
            screen_size: [width, height, 1.0 / width, 1.0 / height],
            time: [time, delta, 0.0, 0.0],
            ..Default::default()
        });

        let Some(scene) = self.scene.as_ref() else {
            return;
        };
        let (triangle, instances) = (scene.triangle, scene.instances);

        let offsets: Vec<[f32; 4]> = (0..INSTANCE_COUNT)
            .map(|i| {
                let angle = time + i as f32 * std::f32::consts::TAU / INSTANCE_COUNT as f32;
                [angle.cos() * 0.8, angle.sin() * 0.8, 0.0, 0.1]
            })
            .collect();
        self.device.upload_buffer(instances, bytemuck::cast_slice(&offsets));

        let model = ModelUniforms {
            model: IDENTITY,
            color: [1.0, 1.0, 1.0, 1.0],
        };

        let cascades = self.device.config().shadow_cascades;
        for cascade in 0..cascades {
            self.device.set_cascade_uniforms(
                cascade,
                &CascadeUniforms {
                    light_view_projection: IDENTITY,
                    split: [(cascade + 1) as f32 / cascades as f32, 0.0, 0.0, 0.0],
                },
            );
            self.device.begin_shadow_pass(cascade);
            self.device
                .draw_instanced(PipelineVariant::ShadowCaster, triangle, 3, instances, INSTANCE_COUNT, &model);
            self.device.end_shadow_pass();
        }

        self.device.begin_geometry_pass();
        self.device
            .draw_instanced(PipelineVariant::GeometryNormals, triangle, 3, instances, INSTANCE_COUNT, &model);
        self.device.end_geometry_pass();

        self.device.begin_ambient_occlusion_pass();
        // Fullscreen triangle generated in the vertex shader.
        self.device
            .draw(PipelineVariant::AmbientOcclusion, BufferHandle::NONE, 3, &model);
        self.device.end_ambient_occlusion_pass();

        let pulse = 0.5 + 0.5 * (time * 0.5).sin();
        self.device.set_clear_color([0.1, 0.2 * pulse, 0.4, 1.0]);
        self.device.begin_main_pass();
        self.device.draw(PipelineVariant::Skybox, BufferHandle::NONE, 36, &model);
        self.device
            .draw_instanced(PipelineVariant::Opaque, triangle, 3, instances, INSTANCE_COUNT, &model);
        self.device.end_main_pass();

        self.device.begin_ui_pass();
        self.device.draw(PipelineVariant::UiQuad, BufferHandle::NONE, 6, &model);
        self.device.end_ui_pass();
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Some(scene) = self.scene.take() {
            scene.destroy(&self.device);
        }
    }
}

struct SandboxLoop {
    config: Option<RhiConfig>,
    sandbox: Option<Sandbox>,
    result: anyhow::Result<()>,

    frame_count: u64,
    last_time_printed: Instant,
}

impl SandboxLoop {
    fn new(config: RhiConfig) -> Self {
        Self {
            config: Some(config),
            sandbox: None,
            result: Ok(()),
            frame_count: 0,
            last_time_printed: Instant::now(),
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:#}");
        self.result = Err(err);
        self.sandbox = None;
        event_loop.exit();
    }

    fn tick(&mut self) {
        self.frame_count += 1;
        let elapsed = self.last_time_printed.elapsed().as_secs_f32();
        if elapsed > 1.0 {
            info!("Frame rate: {} fps", self.frame_count as f32 / elapsed);
            self.last_time_printed = Instant::now();
            self.frame_count = 0;
        }
    }
}

impl ApplicationHandler for SandboxLoop {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.sandbox.is_some() {
            return;
        }
        let Some(config) = self.config.take() else {
            return;
        };

        let window_attributes = Window::default_attributes()
            .with_title("Keel Sandbox")
            .with_min_inner_size(LogicalSize::new(32, 32))
            .with_inner_size(LogicalSize::new(1280, 720));
        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => Arc::new(window),
            Err(err) => return self.fail(event_loop, err.into()),
        };

        match Sandbox::new(window.clone(), config) {
            Ok(sandbox) => {
                self.sandbox = Some(sandbox);
                window.request_redraw();
            }
            Err(err) => self.fail(event_loop, err),
        }
    }

    #[profiling::function]
    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        let Some(sandbox) = self.sandbox.as_mut() else {
            return;
        };

        match event {
            WindowEvent::Resized(size) => sandbox.resize(size.width, size.height),
            WindowEvent::CloseRequested => {
                self.sandbox = None;
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if !sandbox.render() {
                    warn!("Render device lost, shutting down");
                    return self.fail(event_loop, anyhow::anyhow!("render device lost"));
                }
                sandbox.window.request_redraw();
                self.tick();
            }
            _ => {}
        }
    }
}

fn rhi_config(args: &EngineArgs) -> RhiConfig {
    let mut config = RhiConfig::from_env();
    if args.safe_mode {
        config = config.with_safe_mode(true);
    }
    if let Some(frames) = args.frames_in_flight {
        config = config.with_frames_in_flight(frames as usize);
    }
    // Leave through the event loop rather than aborting.
    config.with_fatal_handler(|err| error!("Unrecoverable GPU state: {err}"))
}

fn main() -> anyhow::Result<()> {
    let args = EngineArgs::parse_args();
    log::initialize(args.log_level.into())?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut sandbox = SandboxLoop::new(rhi_config(&args));
    event_loop.run_app(&mut sandbox)?;
    sandbox.result
}
