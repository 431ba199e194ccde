use std::sync::Arc;

use log::debug;

use crate::{
    dae::{DaeModel, Dimensions},
    error::DaeError,
};

pub mod adjoint;
pub mod bdf;
pub mod bdf_state;
pub mod checkpointing;
pub mod config;
mod forward;
pub mod ic;
pub mod jacobian_update;
pub mod memory;
pub mod serialize;
pub mod system;

pub use bdf::{Bdf, BdfOptions, BdfStatistics, StopReason};
pub use checkpointing::Checkpoint;
pub use config::{BdfConfig, Constraint, DaeConfig, Interpolation, NewtonScheme, OptionValue};
pub use memory::{AdvanceOutput, IntegratorMemory, IntegratorStatistics, RetreatOutput};
pub use serialize::PersistedRecord;

/// A validated DAE problem: a model together with the options used to integrate it.
///
/// The integrator itself holds no mutable state. Each call to [Self::create_memory]
/// returns an independent [IntegratorMemory] that can be reset and driven on its own.
pub struct DaeIntegrator<M: DaeModel> {
    model: Arc<M>,
    config: Arc<DaeConfig>,
    dims: Dimensions,
}

impl<M: DaeModel> Clone for DaeIntegrator<M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            config: self.config.clone(),
            dims: self.dims,
        }
    }
}

impl<M: DaeModel> DaeIntegrator<M> {
    /// Check the model and the options against each other.
    ///
    /// Fails with a [crate::error::ConfigError] if the dimensions are inconsistent, if an
    /// option is out of range or has the wrong length, or if a Jacobian pattern does not
    /// match the state sizes.
    pub fn new(model: Arc<M>, config: DaeConfig) -> Result<Self, DaeError> {
        let dims = model.dimensions();
        dims.validate()?;
        config.validate(&dims)?;
        model
            .jacobian_pattern()
            .check_shape(dims.nx1(), dims.nz1())?;
        if dims.has_backward() {
            model
                .backward_jacobian_pattern()
                .check_shape(dims.nrx1(), dims.nrz1())?;
        }
        debug!(
            "integrator for nx = {}, nz = {}, nq = {}, ndir = {} using the {} scheme",
            dims.nx,
            dims.nz,
            dims.nq,
            dims.ndir(),
            config.newton_scheme.name()
        );
        Ok(Self {
            model,
            config: Arc::new(config),
            dims,
        })
    }

    pub fn config(&self) -> &DaeConfig {
        &self.config
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dims
    }

    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    /// Allocate the solver state of a new integration.
    pub fn create_memory(&self) -> Result<IntegratorMemory<M>, DaeError> {
        IntegratorMemory::new(self.model.clone(), self.config.clone())
    }

    /// Write the options as a versioned toml record.
    pub fn serialize(&self) -> Result<String, DaeError> {
        PersistedRecord::new(self.config.as_ref().clone()).to_toml()
    }

    /// Rebuild an integrator for `model` from a record written by [Self::serialize].
    pub fn deserialize(model: Arc<M>, record: &str) -> Result<Self, DaeError> {
        let record = PersistedRecord::from_toml(record)?;
        Self::new(model, record.config)
    }
}
