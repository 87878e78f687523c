//! The model capability seam
//!
//! Framework-specific model code lives behind [`ModelInstance`]; the
//! executor only sees preprocess/forward/postprocess and shape queries.
//! [`ModelFactory`] instantiates models from the manifest when the
//! scheduler pushes a new model table. The mock implementations back the
//! test suite and profile-less development deployments.

use crate::batch::BatchTask;
use crate::task::Task;
use crate::tensor::{Device, Shape, Tensor};
use crate::{BackendError, Result};
use async_trait::async_trait;
use mux_core::{ModelEntry, ModelSession};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Capability interface every framework wrapper implements
#[async_trait]
pub trait ModelInstance: Send + Sync {
    /// The session this instance serves
    fn session(&self) -> &ModelSession;

    /// GPU device index the instance runs on
    fn gpu(&self) -> u32;

    /// Canonical profile key for this instance
    fn profile_id(&self) -> String {
        self.session().profile_id()
    }

    /// Shape of a single input (dimension 0 is the batch dimension)
    fn input_shape(&self) -> Shape;

    /// Named output shapes. Queried before every forward; models with
    /// variable output shapes may return different values per call.
    fn output_shapes(&self) -> HashMap<String, Shape>;

    /// Preallocate the GPU input buffer for a batch of `max_batch` inputs
    fn create_input_array(&self, max_batch: u32) -> Tensor {
        Tensor::zeros(
            max_batch as usize * self.input_shape().elements_per_input(),
            Device::Gpu(self.gpu()),
        )
    }

    /// Decode one raw query into per-input tensors
    async fn preprocess(&self, query: &[u8]) -> Result<Vec<Tensor>>;

    /// Run one batched forward pass, filling the batch's output arrays
    async fn forward(&self, batch: &mut BatchTask) -> Result<()>;

    /// Turn a task's filled output slots into its final result
    async fn postprocess(&self, task: &Task) -> Result<()>;
}

/// Creates model instances when the model table changes
#[async_trait]
pub trait ModelFactory: Send + Sync {
    async fn create(
        &self,
        gpu: u32,
        session: &ModelSession,
        entry: Option<&ModelEntry>,
        max_batch: u32,
    ) -> Result<Arc<dyn ModelInstance>>;
}

/// Mock model for tests and profile-less development
pub struct MockModelInstance {
    session: ModelSession,
    gpu: u32,
    input_shape: Shape,
    output_shapes: HashMap<String, Shape>,
    inputs_per_query: usize,
    forward_delay: Duration,
    fail_forward: AtomicBool,
    forward_count: AtomicU64,
}

impl MockModelInstance {
    pub fn new(session: ModelSession, gpu: u32) -> Self {
        Self {
            session,
            gpu,
            input_shape: Shape::new([0, 4]),
            output_shapes: HashMap::from([("prob".to_string(), Shape::new([0, 2]))]),
            inputs_per_query: 1,
            forward_delay: Duration::ZERO,
            fail_forward: AtomicBool::new(false),
            forward_count: AtomicU64::new(0),
        }
    }

    pub fn with_input_shape(mut self, shape: Shape) -> Self {
        self.input_shape = shape;
        self
    }

    pub fn with_output_shape(mut self, name: impl Into<String>, shape: Shape) -> Self {
        self.output_shapes.insert(name.into(), shape);
        self
    }

    pub fn with_inputs_per_query(mut self, n: usize) -> Self {
        self.inputs_per_query = n;
        self
    }

    pub fn with_forward_delay(mut self, delay: Duration) -> Self {
        self.forward_delay = delay;
        self
    }

    /// Make subsequent forward calls fail (or succeed again)
    pub fn set_fail_forward(&self, fail: bool) {
        self.fail_forward.store(fail, Ordering::Relaxed);
    }

    /// Number of forward calls so far
    pub fn forward_count(&self) -> u64 {
        self.forward_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ModelInstance for MockModelInstance {
    fn session(&self) -> &ModelSession {
        &self.session
    }

    fn gpu(&self) -> u32 {
        self.gpu
    }

    fn input_shape(&self) -> Shape {
        self.input_shape.clone()
    }

    fn output_shapes(&self) -> HashMap<String, Shape> {
        self.output_shapes.clone()
    }

    async fn preprocess(&self, query: &[u8]) -> Result<Vec<Tensor>> {
        let elems = self.input_shape.elements_per_input();
        let value = query.len() as f32;
        Ok((0..self.inputs_per_query)
            .map(|i| Tensor::from_vec(vec![value + i as f32; elems], Device::Cpu))
            .collect())
    }

    async fn forward(&self, batch: &mut BatchTask) -> Result<()> {
        self.forward_count.fetch_add(1, Ordering::Relaxed);
        if !self.forward_delay.is_zero() {
            tokio::time::sleep(self.forward_delay).await;
        }
        if self.fail_forward.load(Ordering::Relaxed) {
            return Err(BackendError::Execution("mock forward failure".to_string()));
        }

        let input = batch.input_array();
        let in_elems = self.input_shape.elements_per_input();
        for (name, shape) in &self.output_shapes {
            let out_elems = shape.elements_per_input();
            let mut data = Vec::with_capacity(out_elems * batch.batch_size());
            for i in 0..batch.batch_size() {
                // derive a deterministic per-input output from the input
                // slice so tests can check the demultiplexing
                let slice = input.slice(i * in_elems, in_elems);
                let mean = slice.as_slice().iter().sum::<f32>() / in_elems as f32;
                data.extend(std::iter::repeat(mean).take(out_elems));
            }
            batch.set_output(name.clone(), Tensor::from_vec(data, Device::Cpu))?;
        }
        Ok(())
    }

    async fn postprocess(&self, _task: &Task) -> Result<()> {
        Ok(())
    }
}

/// Factory producing [`MockModelInstance`]s for every known session
#[derive(Debug, Default)]
pub struct MockModelFactory;

#[async_trait]
impl ModelFactory for MockModelFactory {
    async fn create(
        &self,
        gpu: u32,
        session: &ModelSession,
        _entry: Option<&ModelEntry>,
        _max_batch: u32,
    ) -> Result<Arc<dyn ModelInstance>> {
        Ok(Arc::new(MockModelInstance::new(session.clone(), gpu)))
    }
}
