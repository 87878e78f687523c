//! One batched forward pass
//!
//! A [`BatchTask`] is created fresh for every `Execute()` call, collects up
//! to `max_batch` (input, task) pairs into one contiguous input buffer,
//! carries the model's named output tensors, and is destroyed after the
//! outputs are demultiplexed back onto the owning tasks by position.

use crate::task::{Input, Task};
use crate::tensor::{Device, Tensor};
use crate::{BackendError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// A batch of inputs headed for one forward pass
pub struct BatchTask {
    batch_id: u64,
    max_batch: u32,
    device: Device,
    inputs: Vec<Input>,
    tasks: Vec<Arc<Task>>,
    input_data: Vec<f32>,
    /// Expected elements per input for each named output, recomputed by
    /// the executor before every forward
    output_sizes: HashMap<String, usize>,
    outputs: HashMap<String, Tensor>,
}

impl BatchTask {
    /// Create an empty batch
    pub fn new(batch_id: u64, max_batch: u32, device: Device) -> Self {
        Self {
            batch_id,
            max_batch,
            device,
            inputs: Vec::with_capacity(max_batch as usize),
            tasks: Vec::with_capacity(max_batch as usize),
            input_data: Vec::new(),
            output_sizes: HashMap::new(),
            outputs: HashMap::new(),
        }
    }

    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    /// Number of inputs appended so far
    pub fn batch_size(&self) -> usize {
        self.inputs.len()
    }

    pub fn max_batch(&self) -> u32 {
        self.max_batch
    }

    /// Append one (input, task) pair, copying the input into the
    /// contiguous batch buffer
    pub fn append(&mut self, input: Input, task: Arc<Task>) {
        debug_assert!(self.inputs.len() < self.max_batch as usize);
        self.input_data.extend_from_slice(input.data.as_slice());
        self.inputs.push(input);
        self.tasks.push(task);
    }

    /// The assembled contiguous input buffer for the forward pass
    pub fn input_array(&self) -> Tensor {
        Tensor::from_vec(self.input_data.clone(), self.device)
    }

    /// Declare the expected per-input output sizes for this forward pass
    pub fn create_output_arrays(&mut self, sizes: HashMap<String, usize>) {
        self.output_sizes = sizes;
        self.outputs.clear();
    }

    /// Store one named output produced by the model; its length must be
    /// `batch_size * elements_per_input`
    pub fn set_output(&mut self, name: impl Into<String>, tensor: Tensor) -> Result<()> {
        let name = name.into();
        let per_input = *self.output_sizes.get(&name).ok_or_else(|| {
            BackendError::Execution(format!("model produced undeclared output `{}`", name))
        })?;
        let expected = per_input * self.batch_size();
        if tensor.len() != expected {
            return Err(BackendError::Execution(format!(
                "output `{}` has {} elements, expected {}",
                name,
                tensor.len(),
                expected
            )));
        }
        self.outputs.insert(name, tensor);
        Ok(())
    }

    /// The per-input view of every named output at batch position `index`
    pub fn output_slices(&self, index: usize) -> HashMap<String, Tensor> {
        self.outputs
            .iter()
            .map(|(name, tensor)| {
                let per_input = self.output_sizes[name];
                (name.clone(), tensor.slice(index * per_input, per_input))
            })
            .collect()
    }

    /// Inputs in batch order
    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    /// Owning tasks in batch order
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn make_input_task(value: f32) -> (Input, Arc<Task>) {
        let tensor = Tensor::from_vec(vec![value; 4], Device::Cpu);
        let (task, _rx) = Task::new(
            value as u64,
            value as u64,
            "tensorflow:resnet50:1:50",
            Instant::now() + Duration::from_millis(100),
            vec![tensor],
        );
        let input = task.take_inputs().remove(0);
        (input, task)
    }

    #[test]
    fn test_append_assembles_contiguous_input() {
        let mut batch = BatchTask::new(0, 8, Device::Gpu(0));
        let (i1, t1) = make_input_task(1.0);
        let (i2, t2) = make_input_task(2.0);
        batch.append(i1, t1);
        batch.append(i2, t2);

        assert_eq!(batch.batch_size(), 2);
        let input = batch.input_array();
        assert_eq!(input.len(), 8);
        assert_eq!(&input.as_slice()[..4], &[1.0; 4]);
        assert_eq!(&input.as_slice()[4..], &[2.0; 4]);
    }

    #[test]
    fn test_output_demux_by_position() {
        let mut batch = BatchTask::new(3, 8, Device::Gpu(0));
        let (i1, t1) = make_input_task(1.0);
        let (i2, t2) = make_input_task(2.0);
        batch.append(i1, t1);
        batch.append(i2, t2);

        batch.create_output_arrays(HashMap::from([("prob".to_string(), 2)]));
        batch
            .set_output("prob", Tensor::from_vec(vec![0.1, 0.9, 0.8, 0.2], Device::Cpu))
            .unwrap();

        let first = batch.output_slices(0);
        assert_eq!(first["prob"].as_slice(), &[0.1, 0.9]);
        let second = batch.output_slices(1);
        assert_eq!(second["prob"].as_slice(), &[0.8, 0.2]);
    }

    #[test]
    fn test_output_size_validation() {
        let mut batch = BatchTask::new(0, 8, Device::Gpu(0));
        let (i1, t1) = make_input_task(1.0);
        batch.append(i1, t1);
        batch.create_output_arrays(HashMap::from([("prob".to_string(), 2)]));

        assert!(batch
            .set_output("prob", Tensor::zeros(3, Device::Cpu))
            .is_err());
        assert!(batch
            .set_output("logits", Tensor::zeros(2, Device::Cpu))
            .is_err());
        assert!(batch
            .set_output("prob", Tensor::zeros(2, Device::Cpu))
            .is_ok());
    }
}
