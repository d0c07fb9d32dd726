use anyhow::{anyhow, Result};
use tch::{Device, Kind, Tensor};

/// Shape and element kind used to pre-allocate one array of a [`BatchSlot`].
///
/// The shape is only the *initial* shape: loaders are free to reshape an array
/// for every batch they write. The kind is kept unless the loader writes a
/// tensor of a different kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ArraySpec {
    pub shape: Vec<i64>,
    pub kind: Kind,
}

impl ArraySpec {
    pub fn new(shape: impl Into<Vec<i64>>, kind: Kind) -> Self {
        Self {
            shape: shape.into(),
            kind,
        }
    }
}

impl Default for ArraySpec {
    fn default() -> Self {
        Self::new([1], Kind::Float)
    }
}

/// The `BatchSlot` struct is a reusable buffer holding one prepared batch.
///
/// It contains:
/// - a primary `data` tensor (e.g. `[batch, channels, height, width]` images)
/// - an ordered list of secondary tensors (labels, side channels, index arrays)
///
/// The number of secondary arrays is fixed when the slot is allocated, their
/// shapes may change with every batch. A slot has a stable `id` for its whole
/// lifetime and is never cloned: it is moved between the free queue, the
/// worker, the full queue and the consumer, so exactly one party can touch
/// its contents at any time.
///
/// When device staging is enabled the slot also carries device-resident
/// mirrors of every array; the worker refreshes them after each load.
#[derive(Debug)]
pub struct BatchSlot {
    id: usize,
    data: Tensor,
    labels: Vec<Tensor>,
    staged: Option<StagedArrays>,
}

#[derive(Debug)]
struct StagedArrays {
    data: Tensor,
    labels: Vec<Tensor>,
}

impl BatchSlot {
    /// Allocates a host-resident slot with one array per spec.
    pub fn new(id: usize, data: &ArraySpec, labels: &[ArraySpec]) -> Self {
        Self {
            id,
            data: Tensor::empty(data.shape.as_slice(), (data.kind, Device::Cpu)),
            labels: labels
                .iter()
                .map(|spec| Tensor::empty(spec.shape.as_slice(), (spec.kind, Device::Cpu)))
                .collect(),
            staged: None,
        }
    }

    /// Touches every host array and, if `staging` is set, allocates the device
    /// mirrors, so that no allocation happens on the worker thread later.
    pub fn warm_up(&mut self, staging: Option<Device>) {
        let _ = self.data.zero_();
        for label in self.labels.iter_mut() {
            let _ = label.zero_();
        }

        self.staged = staging.map(|device| StagedArrays {
            data: Tensor::zeros(self.data.size(), (self.data.kind(), device)),
            labels: self
                .labels
                .iter()
                .map(|label| Tensor::zeros(label.size(), (label.kind(), device)))
                .collect(),
        });
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Tensor {
        &mut self.data
    }

    /// Reshapes the primary array, keeping its kind, and returns it for writing.
    pub fn reshape_data(&mut self, shape: &[i64]) -> &mut Tensor {
        let kind = self.data.kind();
        reshape_array(&mut self.data, shape, kind);
        &mut self.data
    }

    /// Overwrites the primary array with the contents of `src`.
    pub fn set_data(&mut self, src: &Tensor) {
        copy_array(src, &mut self.data);
    }

    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    pub fn labels(&self) -> &[Tensor] {
        &self.labels
    }

    pub fn label(&self, index: usize) -> Option<&Tensor> {
        self.labels.get(index)
    }

    pub fn label_mut(&mut self, index: usize) -> Option<&mut Tensor> {
        self.labels.get_mut(index)
    }

    /// Reshapes secondary array `index`, keeping its kind.
    pub fn reshape_label(&mut self, index: usize, shape: &[i64]) -> Result<&mut Tensor> {
        let num_labels = self.labels.len();
        let label = self.labels.get_mut(index).ok_or_else(|| {
            anyhow!("Label index {} out of range (slot has {} labels)", index, num_labels)
        })?;
        let kind = label.kind();
        reshape_array(label, shape, kind);
        Ok(label)
    }

    /// Overwrites secondary array `index` with the contents of `src`.
    pub fn set_label(&mut self, index: usize, src: &Tensor) -> Result<()> {
        let num_labels = self.labels.len();
        let label = self.labels.get_mut(index).ok_or_else(|| {
            anyhow!("Label index {} out of range (slot has {} labels)", index, num_labels)
        })?;
        copy_array(src, label);
        Ok(())
    }

    /// Whether the slot carries device mirrors.
    pub fn is_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Copies every host array of this slot into `dst`, reshaping as needed.
    pub fn copy_to(&self, dst: &mut BatchSlot) -> Result<()> {
        if dst.labels.len() != self.labels.len() {
            return Err(anyhow!(
                "Cannot copy slot {} ({} labels) into slot {} ({} labels)",
                self.id,
                self.labels.len(),
                dst.id,
                dst.labels.len()
            ));
        }
        copy_array(&self.data, &mut dst.data);
        for (src, dst) in self.labels.iter().zip(dst.labels.iter_mut()) {
            copy_array(src, dst);
        }
        Ok(())
    }

    /// Copies the slot's contents into caller-owned tensors.
    ///
    /// Reads from the device mirrors when the slot is staged. Every secondary
    /// array is exported in order, up to `labels.len()`; an empty slice skips
    /// the secondary arrays entirely.
    pub(crate) fn export(&self, data: &mut Tensor, labels: &mut [Tensor]) {
        let (src_data, src_labels) = match &self.staged {
            Some(staged) => (&staged.data, &staged.labels),
            None => (&self.data, &self.labels),
        };
        copy_array(src_data, data);
        for (src, dst) in src_labels.iter().zip(labels.iter_mut()) {
            copy_array(src, dst);
        }
    }

    /// Pairs each host array with its device mirror, in export order.
    pub(crate) fn staging_pairs(
        &mut self,
    ) -> Option<impl Iterator<Item = (&Tensor, &mut Tensor)> + '_> {
        let staged = self.staged.as_mut()?;
        let hosts = std::iter::once(&self.data).chain(self.labels.iter());
        let mirrors = std::iter::once(&mut staged.data).chain(staged.labels.iter_mut());
        Some(hosts.zip(mirrors))
    }
}

/// Reallocates `tensor` on its current device when its shape or kind differ
/// from the requested ones. Prior contents are not preserved.
pub fn reshape_array(tensor: &mut Tensor, shape: &[i64], kind: Kind) {
    let device = if tensor.defined() {
        tensor.device()
    } else {
        Device::Cpu
    };
    if !tensor.defined() || tensor.size() != shape || tensor.kind() != kind {
        *tensor = Tensor::empty(shape, (kind, device));
    }
}

/// Reshapes `dst` like `src`, then copies every element of `src` into it.
pub fn copy_array(src: &Tensor, dst: &mut Tensor) {
    reshape_array(dst, &src.size(), src.kind());
    dst.copy_(src);
}
