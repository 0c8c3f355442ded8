use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Three-dimensional size, used for invocation grids, local workgroup sizes
/// and the resulting dispatch counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 3]", into = "[u32; 3]")]
pub struct Extent3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Extent3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// A grid extending only along x.
    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    pub fn to_array(self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    /// Total number of cells.
    pub fn volume(self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl From<[u32; 3]> for Extent3 {
    fn from([x, y, z]: [u32; 3]) -> Self {
        Self { x, y, z }
    }
}

impl From<Extent3> for [u32; 3] {
    fn from(e: Extent3) -> Self {
        e.to_array()
    }
}

impl fmt::Display for Extent3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.x, self.y, self.z)
    }
}

/// Number of workgroups to dispatch along each axis so that every requested
/// invocation is covered: `ceil(invocations / local_size)`.
pub fn workgroup_counts(invocations: Extent3, local_size: Extent3) -> Result<Extent3, CoreError> {
    let axis = |name: &str, inv: u32, local: u32| -> Result<u32, CoreError> {
        if local == 0 {
            return Err(CoreError::InvalidParams(format!(
                "local size along {} must be non-zero",
                name
            )));
        }
        Ok(inv.div_ceil(local))
    };

    Ok(Extent3 {
        x: axis("x", invocations.x, local_size.x)?,
        y: axis("y", invocations.y, local_size.y)?,
        z: axis("z", invocations.z, local_size.z)?,
    })
}

/// Check that a buffer of `count` elements is non-empty and addressable with
/// 32-bit invocation indices, returning the count as `u32`.
pub fn check_element_count(count: usize) -> Result<u32, CoreError> {
    if count == 0 {
        return Err(CoreError::InvalidParams("buffer must hold at least one element".to_string()));
    }
    u32::try_from(count)
        .map_err(|_| CoreError::InvalidParams(format!("buffer of {} elements is too large", count)))
}

/// Everything needed to run one dispatch over one `f32` storage buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchParams {
    /// Path to a SPIR-V binary or WGSL source.
    pub shader: PathBuf,
    /// Shader entry point name.
    pub entry_point: String,
    /// Initial buffer contents; the buffer holds exactly this many elements.
    pub data: Vec<f32>,
    pub invocations: Extent3,
    pub local_size: Extent3,
}

impl DispatchParams {
    pub fn new(
        shader: impl Into<PathBuf>,
        data: Vec<f32>,
        invocations: impl Into<Extent3>,
        local_size: impl Into<Extent3>,
    ) -> Self {
        Self {
            shader: shader.into(),
            entry_point: "main".to_string(),
            data,
            invocations: invocations.into(),
            local_size: local_size.into(),
        }
    }

    /// Buffer of `count` copies of `value`, one invocation per element along x.
    pub fn filled(shader: impl Into<PathBuf>, count: usize, value: f32, local_size: impl Into<Extent3>) -> Self {
        Self::new(
            shader,
            vec![value; count],
            Extent3::linear(count as u32),
            local_size,
        )
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    pub fn shader_path(&self) -> &Path {
        &self.shader
    }

    pub fn element_count(&self) -> usize {
        self.data.len()
    }

    /// Buffer size in bytes.
    pub fn buffer_size(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<f32>()) as u64
    }

    /// Reject parameters that could never produce a meaningful dispatch.
    pub fn validate(&self) -> Result<(), CoreError> {
        check_element_count(self.data.len())?;
        if self.invocations.volume() == 0 {
            return Err(CoreError::InvalidParams(format!(
                "invocation grid {} is empty",
                self.invocations
            )));
        }
        if self.entry_point.is_empty() || self.entry_point.contains('\0') {
            return Err(CoreError::InvalidParams(format!(
                "invalid entry point name {:?}",
                self.entry_point
            )));
        }
        workgroup_counts(self.invocations, self.local_size).map(|_| ())
    }

    /// Workgroup counts for this dispatch.
    pub fn workgroups(&self) -> Result<Extent3, CoreError> {
        workgroup_counts(self.invocations, self.local_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_grid_rounds_up_to_one_group() {
        let groups = workgroup_counts(Extent3::linear(10), Extent3::linear(1024)).unwrap();
        assert_eq!(groups, Extent3::new(1, 1, 1));
    }

    #[test]
    fn counts_round_up_per_axis() {
        let groups =
            workgroup_counts(Extent3::new(1025, 64, 7), Extent3::new(1024, 8, 2)).unwrap();
        assert_eq!(groups.to_array(), [2, 8, 4]);

        let exact = workgroup_counts(Extent3::new(2048, 16, 1), Extent3::new(1024, 16, 1)).unwrap();
        assert_eq!(exact.to_array(), [2, 1, 1]);
    }

    #[test]
    fn zero_local_size_is_rejected() {
        let err = workgroup_counts(Extent3::linear(10), Extent3::new(64, 0, 1)).unwrap_err();
        assert!(err.to_string().contains("along y"));
    }

    #[test]
    fn filled_params_describe_a_linear_buffer() {
        let params = DispatchParams::filled("identity.spv", 10, 1.0, [1024, 1, 1]);
        assert_eq!(params.element_count(), 10);
        assert_eq!(params.buffer_size(), 40);
        assert_eq!(params.invocations, Extent3::linear(10));
        assert!(params.data.iter().all(|&v| v == 1.0));
        assert_eq!(params.entry_point, "main");
        params.validate().unwrap();
    }

    #[test]
    fn validate_rejects_empty_inputs() {
        let empty = DispatchParams::new("s.spv", Vec::new(), [1, 1, 1], [1, 1, 1]);
        assert!(matches!(empty.validate(), Err(CoreError::InvalidParams(_))));

        let no_grid = DispatchParams::new("s.spv", vec![0.0], [0, 1, 1], [1, 1, 1]);
        assert!(matches!(no_grid.validate(), Err(CoreError::InvalidParams(_))));

        let bad_entry = DispatchParams::filled("s.spv", 4, 0.0, [4, 1, 1]).with_entry_point("ma\0in");
        assert!(matches!(bad_entry.validate(), Err(CoreError::InvalidParams(_))));
    }

    #[test]
    fn element_count_must_fit_invocation_indices() {
        assert_eq!(check_element_count(10).unwrap(), 10);
        assert_eq!(check_element_count(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(check_element_count(0).is_err());
        if let Some(too_many) = (u32::MAX as usize).checked_add(1) {
            assert!(check_element_count(too_many).is_err());
        }
    }

    #[test]
    fn extent_displays_as_dimensions() {
        assert_eq!(Extent3::new(4, 2, 1).to_string(), "4x2x1");
    }
}
