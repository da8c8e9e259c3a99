use std::{borrow::Cow, collections::HashMap, num::NonZeroU64, sync::mpsc};

use pollster::FutureExt;
use wgpu::{
    util::{BufferInitDescriptor, DeviceExt},
    Adapter, BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout,
    BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindingType, Buffer, BufferBindingType,
    BufferDescriptor, BufferUsages, CommandEncoder, ComputePipeline, ComputePipelineDescriptor,
    Device, ErrorFilter, Instance, InstanceDescriptor, Maintain, MapMode,
    PipelineLayoutDescriptor, Queue, RequestAdapterOptions, ShaderModule, ShaderModuleDescriptor,
    ShaderSource, ShaderStages, SubmissionIndex,
};

use crate::{
    compiler::Runner,
    error::{Error, Result},
    fusion::Fusion,
    graph::ExprId,
    tensor::{Layout, Tensor},
};

use super::compiler::{WgpuCompiler, WgpuPlan, WgpuStep};

#[derive(Debug)]
pub(crate) enum ConcreteWgpuStep {
    Deallocate(ExprId),
    Execute {
        output: ExprId,
        output_size: u64,
        compute_pipeline: ComputePipeline,
        bind_group_layout: BindGroupLayout,
        workgroups: [u32; 3],
        inputs: Box<[ExprId]>,
    },
}

#[derive(Debug)]
pub struct ConcreteWgpuPlan {
    pub(crate) inputs: Vec<ExprId>,
    pub(crate) input_layouts: Vec<Layout>,
    pub(crate) steps: Vec<ConcreteWgpuStep>,
    pub(crate) outputs: Vec<ExprId>,
    pub(crate) output_layouts: Vec<Layout>,
}

pub struct WgpuRunner {
    device: Device,
    queue: Queue,
    buffers: HashMap<ExprId, Buffer>,
    workgroup_size_x: u32,
}

impl WgpuRunner {
    /// Opens the default adapter. `WGPU_BACKEND` and `WGPU_POWER_PREF`
    /// narrow the choice.
    pub fn new() -> Result<Self> {
        let instance = Instance::new(InstanceDescriptor {
            backends: wgpu::util::backend_bits_from_env().unwrap_or_default(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: wgpu::util::power_preference_from_env().unwrap_or_default(),
                ..Default::default()
            })
            .block_on()
            .ok_or_else(|| Error::Initialization(String::from("could not find adapter")))?;

        Self::new_with_adapter(adapter).block_on()
    }

    pub async fn new_with_adapter(adapter: Adapter) -> Result<Self> {
        let info = adapter.get_info();

        log::info!("using adapter {} ({:?})", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(&Default::default(), None)
            .await
            .map_err(|error| Error::Initialization(format!("could not get device: {error}")))?;

        Ok(Self {
            device,
            queue,
            buffers: HashMap::new(),
            workgroup_size_x: WgpuCompiler::default().workgroup_size_x,
        })
    }

    pub fn with_workgroup_size(mut self, workgroup_size_x: u32) -> Self {
        self.workgroup_size_x = workgroup_size_x;

        self
    }

    fn track(&mut self, id: ExprId, buffer: Buffer) {
        self.buffers.insert(id, buffer);
    }

    fn buffer(&self, id: ExprId) -> Result<&Buffer> {
        self.buffers
            .get(&id)
            .ok_or_else(|| Error::RuntimeCompute(format!("{id:?} is not resident")))
    }

    fn allocate(&mut self, id: ExprId, tensor: &Tensor) {
        self.track(
            id,
            self.device.create_buffer_init(&BufferInitDescriptor {
                label: None,
                contents: bytemuck::cast_slice(&tensor.data),
                usage: BufferUsages::COPY_DST | BufferUsages::COPY_SRC | BufferUsages::STORAGE,
            }),
        );
    }

    fn deallocate(&mut self, id: ExprId) {
        self.buffers.remove(&id);
    }

    fn retrieve(&self, id: ExprId, layout: &Layout) -> Result<Tensor> {
        if layout.elements() == 0 {
            return Ok(Tensor::zeros(layout.clone()));
        }

        let buffer = self.buffer(id)?;
        let staging_buffer = self.create_staging_buffer(layout);

        let mut encoder = self.create_command_encoder();

        encoder.copy_buffer_to_buffer(buffer, 0, &staging_buffer, 0, layout.size() as u64);

        let copy_submission = self.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = mpsc::channel();
        let buffer_slice = staging_buffer.slice(..);
        buffer_slice.map_async(MapMode::Read, move |result| {
            let _ = sender.send(result);
        });

        self.device
            .poll(Maintain::WaitForSubmissionIndex(copy_submission));

        receiver
            .recv()
            .map_err(|_| Error::RuntimeCompute(String::from("buffer mapping was dropped")))?
            .map_err(|error| Error::RuntimeCompute(format!("could not map buffer: {error}")))?;

        let data = buffer_slice.get_mapped_range();
        let tensor = Tensor {
            data: bytemuck::cast_slice(&data).to_vec().into_boxed_slice(),
            layout: layout.clone(),
        };

        drop(data);
        staging_buffer.unmap();

        Ok(tensor)
    }

    /// Runs `scope` and turns any validation error it raised into `Err`.
    fn validated<T>(&self, what: &str, scope: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.device.push_error_scope(ErrorFilter::Validation);

        let result = scope(self);

        match self.device.pop_error_scope().block_on() {
            Some(error) => Err(Error::RuntimeCompute(format!("{what}: {error}"))),
            None => result,
        }
    }

    fn create_shader_module(&self, contents: &str) -> ShaderModule {
        self.device.create_shader_module(ShaderModuleDescriptor {
            label: None,
            source: ShaderSource::Wgsl(Cow::Borrowed(contents)),
        })
    }

    fn create_staging_buffer(&self, layout: &Layout) -> Buffer {
        self.device.create_buffer(&BufferDescriptor {
            label: None,
            size: layout.size() as u64,
            usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
            mapped_at_creation: false,
        })
    }

    fn create_output_buffer(&mut self, id: ExprId, size: u64) {
        self.track(
            id,
            self.device.create_buffer(&BufferDescriptor {
                label: None,
                size,
                usage: BufferUsages::COPY_SRC | BufferUsages::STORAGE,
                mapped_at_creation: false,
            }),
        );
    }

    fn create_compute_pipeline(
        &self,
        module: &ShaderModule,
        entry_point: &str,
        bind_group_layout: &BindGroupLayout,
    ) -> ComputePipeline {
        self.device
            .create_compute_pipeline(&ComputePipelineDescriptor {
                label: None,
                layout: Some(
                    &self
                        .device
                        .create_pipeline_layout(&PipelineLayoutDescriptor {
                            label: None,
                            bind_group_layouts: &[bind_group_layout],
                            push_constant_ranges: &[],
                        }),
                ),
                module,
                entry_point,
            })
    }

    fn create_bind_group_layout(&self, inputs_layout: &[(usize, bool)]) -> BindGroupLayout {
        self.device
            .create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: None,
                entries: &inputs_layout
                    .iter()
                    .enumerate()
                    .map(|(index, &(size, read_only))| BindGroupLayoutEntry {
                        binding: index as u32,
                        visibility: ShaderStages::COMPUTE,
                        ty: BindingType::Buffer {
                            ty: BufferBindingType::Storage { read_only },
                            has_dynamic_offset: false,
                            min_binding_size: NonZeroU64::new(size as u64),
                        },
                        count: None,
                    })
                    .collect::<Vec<_>>(),
            })
    }

    fn create_bind_group(&self, layout: &BindGroupLayout, buffers: &[&Buffer]) -> BindGroup {
        self.device.create_bind_group(&BindGroupDescriptor {
            label: None,
            layout,
            entries: buffers
                .iter()
                .enumerate()
                .map(|(index, buffer)| BindGroupEntry {
                    binding: index as u32,
                    resource: buffer.as_entire_binding(),
                })
                .collect::<Vec<_>>()
                .as_slice(),
        })
    }

    fn create_command_encoder(&self) -> CommandEncoder {
        self.device.create_command_encoder(&Default::default())
    }

    fn start_compute_pass(
        &self,
        mut encoder: CommandEncoder,
        compute_pipeline: &ComputePipeline,
        bind_group: &BindGroup,
        workgroups: [u32; 3],
    ) -> SubmissionIndex {
        {
            let mut compute_pass = encoder.begin_compute_pass(&Default::default());

            compute_pass.set_pipeline(compute_pipeline);
            compute_pass.set_bind_group(0, bind_group, &[]);
            compute_pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
        }

        self.queue.submit(Some(encoder.finish()))
    }

    fn execute_pipeline(
        &self,
        compute_pipeline: &ComputePipeline,
        workgroups: [u32; 3],
        bind_group_layout: &BindGroupLayout,
        buffers: &[ExprId],
    ) -> Result<()> {
        let buffers = buffers
            .iter()
            .map(|&id| self.buffer(id))
            .collect::<Result<Vec<_>>>()?;

        let bind_group = self.create_bind_group(bind_group_layout, &buffers);

        let encoder = self.create_command_encoder();

        self.start_compute_pass(encoder, compute_pipeline, &bind_group, workgroups);

        Ok(())
    }

    fn run_steps(&mut self, plan: &ConcreteWgpuPlan, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        if inputs.len() != plan.inputs.len() {
            return Err(Error::Shape(format!(
                "expected {} inputs, got {}",
                plan.inputs.len(),
                inputs.len()
            )));
        }

        for ((&id, layout), input) in plan.inputs.iter().zip(&plan.input_layouts).zip(inputs) {
            if input.layout() != layout {
                return Err(Error::Shape(format!(
                    "expected a {layout} input, got {}",
                    input.layout()
                )));
            }

            if layout.elements() > 0 {
                self.allocate(id, input);
            }
        }

        for step in &plan.steps {
            match step {
                ConcreteWgpuStep::Deallocate(id) => {
                    self.deallocate(*id);
                }
                ConcreteWgpuStep::Execute {
                    output,
                    output_size,
                    compute_pipeline,
                    bind_group_layout,
                    workgroups,
                    inputs,
                } => {
                    self.create_output_buffer(*output, *output_size);

                    self.validated("dispatch failed", |runner| {
                        runner.execute_pipeline(
                            compute_pipeline,
                            *workgroups,
                            bind_group_layout,
                            inputs,
                        )
                    })?;
                }
            }
        }

        plan.outputs
            .iter()
            .zip(&plan.output_layouts)
            .map(|(&id, layout)| self.retrieve(id, layout))
            .collect()
    }
}

impl Runner for WgpuRunner {
    type Compiler = WgpuCompiler;

    type Runnable = ConcreteWgpuPlan;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn compiler(&self, fusion: Fusion) -> WgpuCompiler {
        WgpuCompiler {
            workgroup_size_x: self.workgroup_size_x,
            fusion,
        }
    }

    fn preprocess(&mut self, plan: WgpuPlan) -> Result<ConcreteWgpuPlan> {
        let steps = plan
            .steps
            .into_iter()
            .map(|step| match step {
                WgpuStep::Deallocate(id) => Ok(ConcreteWgpuStep::Deallocate(id)),
                WgpuStep::Execute {
                    output,
                    source,
                    workgroups,
                    inputs,
                    inputs_layout,
                } => self.validated("pipeline creation failed", |runner| {
                    let module = runner.create_shader_module(&source);
                    let bind_group_layout = runner.create_bind_group_layout(&inputs_layout);

                    Ok(ConcreteWgpuStep::Execute {
                        output,
                        output_size: inputs_layout.last().map_or(0, |&(size, _)| size as u64),
                        compute_pipeline: runner.create_compute_pipeline(
                            &module,
                            "main",
                            &bind_group_layout,
                        ),
                        bind_group_layout,
                        workgroups,
                        inputs,
                    })
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ConcreteWgpuPlan {
            inputs: plan.inputs,
            input_layouts: plan.input_layouts,
            steps,
            outputs: plan.outputs,
            output_layouts: plan.output_layouts,
        })
    }

    fn run(&mut self, plan: &ConcreteWgpuPlan, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let outputs = self.run_steps(plan, inputs);

        self.buffers.clear();

        outputs
    }
}
