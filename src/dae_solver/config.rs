use serde::{Deserialize, Serialize};

use crate::{
    dae::Dimensions,
    error::ConfigError,
    linear_solver::{krylov::KrylovMethod, DirectSolverKind},
};

/// Step-size and order control constants of the BDF engine.
#[derive(Debug, Clone)]
pub struct BdfConfig {
    pub minimum_timestep: f64,
    pub maximum_error_test_failures: usize,
    pub maximum_convergence_failures: usize,
    pub maximum_timestep_growth: f64,
    pub minimum_timestep_growth: f64,
    pub maximum_timestep_shrink: f64,
    pub minimum_timestep_shrink: f64,
    pub constraint_timestep_shrink: f64,
    pub maximum_newton_iterations: usize,
}

impl Default for BdfConfig {
    fn default() -> Self {
        Self {
            minimum_timestep: 1e-32,
            maximum_error_test_failures: 40,
            maximum_convergence_failures: 10,
            maximum_timestep_growth: 2.1,
            minimum_timestep_growth: 2.0,
            maximum_timestep_shrink: 0.9,
            minimum_timestep_shrink: 0.5,
            constraint_timestep_shrink: 0.25,
            maximum_newton_iterations: 4,
        }
    }
}

/// Bound imposed on a single state component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Constraint {
    #[default]
    None,
    NonNegative,
    NonPositive,
    Positive,
    Negative,
}

impl Constraint {
    /// Integer code, `0`, `1` (>= 0), `-1` (<= 0), `2` (> 0) or `-2` (< 0).
    pub fn code(self) -> i32 {
        match self {
            Constraint::None => 0,
            Constraint::NonNegative => 1,
            Constraint::NonPositive => -1,
            Constraint::Positive => 2,
            Constraint::Negative => -2,
        }
    }

    pub fn is_satisfied(self, value: f64) -> bool {
        match self {
            Constraint::None => true,
            Constraint::NonNegative => value >= 0.0,
            Constraint::NonPositive => value <= 0.0,
            Constraint::Positive => value > 0.0,
            Constraint::Negative => value < 0.0,
        }
    }
}

impl TryFrom<i32> for Constraint {
    type Error = ConfigError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Constraint::None),
            1 => Ok(Constraint::NonNegative),
            -1 => Ok(Constraint::NonPositive),
            2 => Ok(Constraint::Positive),
            -2 => Ok(Constraint::Negative),
            _ => Err(ConfigError::InvalidValue {
                name: "constraints",
                reason: format!("{code} is not one of 0, 1, -1, 2, -2"),
            }),
        }
    }
}

impl From<Constraint> for i32 {
    fn from(c: Constraint) -> Self {
        c.code()
    }
}

/// How the Newton correction equation is solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewtonScheme {
    #[default]
    Direct,
    Gmres,
    Bicgstab,
    Tfqmr,
}

impl NewtonScheme {
    pub fn name(&self) -> &'static str {
        match self {
            NewtonScheme::Direct => "direct",
            NewtonScheme::Gmres => "gmres",
            NewtonScheme::Bicgstab => "bcgstab",
            NewtonScheme::Tfqmr => "tfqmr",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "direct" => Some(NewtonScheme::Direct),
            "gmres" => Some(NewtonScheme::Gmres),
            "bcgstab" | "bicgstab" => Some(NewtonScheme::Bicgstab),
            "tfqmr" => Some(NewtonScheme::Tfqmr),
            _ => None,
        }
    }

    /// The Krylov method of an iterative scheme.
    pub fn krylov_method(&self) -> Option<KrylovMethod> {
        match self {
            NewtonScheme::Direct => None,
            NewtonScheme::Gmres => Some(KrylovMethod::Gmres),
            NewtonScheme::Bicgstab => Some(KrylovMethod::Bicgstab),
            NewtonScheme::Tfqmr => Some(KrylovMethod::Tfqmr),
        }
    }
}

/// Interpolation of the forward trajectory during the backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// cubic Hermite interpolation between stored steps
    #[default]
    Hermite,
    /// the BDF interpolating polynomial of each stored step
    Polynomial,
}

impl Interpolation {
    pub fn name(&self) -> &'static str {
        match self {
            Interpolation::Hermite => "hermite",
            Interpolation::Polynomial => "polynomial",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hermite" => Some(Interpolation::Hermite),
            "polynomial" => Some(Interpolation::Polynomial),
            _ => None,
        }
    }
}

/// Integrator options, fixed once a [crate::DaeIntegrator] is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaeConfig {
    pub t0: f64,
    /// breakpoints of the controls, the last entry is the end of the horizon
    pub grid: Vec<f64>,
    pub reltol: f64,
    pub abstol: f64,
    /// per-component absolute tolerance, overrides `abstol` when not empty
    pub abstolv: Vec<f64>,
    /// maximum number of steps per `advance` or `retreat`
    pub max_num_steps: usize,
    pub max_multistep_order: usize,
    /// initial step size, 0 picks one automatically
    pub step0: f64,
    /// 0 means unbounded
    pub max_step_size: f64,
    pub constraints: Vec<Constraint>,
    pub suppress_algebraic: bool,
    pub calc_ic: bool,
    /// defaults to `calc_ic`
    pub calc_icb: Option<bool>,
    /// time of the initial condition correction, as a fraction of the horizon
    pub first_time: f64,
    pub cj_scaling: bool,
    pub cj_scaling_backward: bool,
    /// initial guess of `[xdot; zdot]`, zeros when empty
    pub init_xdot: Vec<f64>,
    pub quad_err_con: bool,
    pub interpolation: Interpolation,
    pub steps_per_checkpoint: usize,
    pub newton_scheme: NewtonScheme,
    pub linear_solver: DirectSolverKind,
    pub max_krylov: usize,
    pub use_preconditioner: bool,
    pub second_order_correction: bool,
    pub nonlin_conv_coeff: f64,
    /// number of independent backward problems sharing the forward trajectory
    pub n_backward: usize,
}

impl Default for DaeConfig {
    fn default() -> Self {
        Self {
            t0: 0.0,
            grid: vec![1.0],
            reltol: 1e-6,
            abstol: 1e-8,
            abstolv: Vec::new(),
            max_num_steps: 10000,
            max_multistep_order: 5,
            step0: 0.0,
            max_step_size: 0.0,
            constraints: Vec::new(),
            suppress_algebraic: false,
            calc_ic: true,
            calc_icb: None,
            first_time: 1.0,
            cj_scaling: true,
            cj_scaling_backward: true,
            init_xdot: Vec::new(),
            quad_err_con: false,
            interpolation: Interpolation::Hermite,
            steps_per_checkpoint: 20,
            newton_scheme: NewtonScheme::Direct,
            linear_solver: DirectSolverKind::DenseLu,
            max_krylov: 10,
            use_preconditioner: true,
            second_order_correction: true,
            nonlin_conv_coeff: 0.33,
            n_backward: 1,
        }
    }
}

/// A value passed through [DaeConfig::set_option].
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        OptionValue::Int(v.into())
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Str(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Str(v)
    }
}

impl From<Vec<i64>> for OptionValue {
    fn from(v: Vec<i64>) -> Self {
        OptionValue::Ints(v)
    }
}

impl From<Vec<i32>> for OptionValue {
    fn from(v: Vec<i32>) -> Self {
        OptionValue::Ints(v.into_iter().map(i64::from).collect())
    }
}

impl From<Vec<f64>> for OptionValue {
    fn from(v: Vec<f64>) -> Self {
        OptionValue::Floats(v)
    }
}

impl OptionValue {
    fn wrong_type(name: &str, expected: &'static str) -> ConfigError {
        ConfigError::WrongOptionType {
            name: name.to_string(),
            expected,
        }
    }

    fn as_bool(&self, name: &str) -> Result<bool, ConfigError> {
        match self {
            OptionValue::Bool(v) => Ok(*v),
            _ => Err(Self::wrong_type(name, "bool")),
        }
    }

    fn as_f64(&self, name: &str) -> Result<f64, ConfigError> {
        match self {
            OptionValue::Float(v) => Ok(*v),
            OptionValue::Int(v) => Ok(*v as f64),
            _ => Err(Self::wrong_type(name, "float")),
        }
    }

    fn as_usize(&self, name: &str) -> Result<usize, ConfigError> {
        match self {
            OptionValue::Int(v) => {
                usize::try_from(*v).map_err(|_| Self::wrong_type(name, "non-negative integer"))
            }
            _ => Err(Self::wrong_type(name, "non-negative integer")),
        }
    }

    fn as_str(&self, name: &str) -> Result<&str, ConfigError> {
        match self {
            OptionValue::Str(v) => Ok(v),
            _ => Err(Self::wrong_type(name, "string")),
        }
    }

    fn as_floats(&self, name: &str) -> Result<Vec<f64>, ConfigError> {
        match self {
            OptionValue::Floats(v) => Ok(v.clone()),
            OptionValue::Ints(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            _ => Err(Self::wrong_type(name, "list of floats")),
        }
    }

    fn as_ints(&self, name: &str) -> Result<&[i64], ConfigError> {
        match self {
            OptionValue::Ints(v) => Ok(v),
            _ => Err(Self::wrong_type(name, "list of integers")),
        }
    }
}

impl DaeConfig {
    pub fn tf(&self) -> f64 {
        self.grid.last().copied().unwrap_or(self.t0)
    }

    pub fn calc_icb(&self) -> bool {
        self.calc_icb.unwrap_or(self.calc_ic)
    }

    /// The user supplied first step size, capped by `max_step_size`.
    pub fn step0_capped(&self) -> Option<f64> {
        if !(self.step0 > 0.0) {
            return None;
        }
        if self.max_step_size > 0.0 {
            Some(self.step0.min(self.max_step_size))
        } else {
            Some(self.step0)
        }
    }

    /// Absolute tolerance of each of the `n` state components.
    pub fn abstol_vector(&self, n: usize) -> Vec<f64> {
        if self.abstolv.is_empty() {
            vec![self.abstol; n]
        } else {
            self.abstolv.clone()
        }
    }

    /// Set an option by name.
    pub fn set_option(
        &mut self,
        name: &str,
        value: impl Into<OptionValue>,
    ) -> Result<(), ConfigError> {
        let value = value.into();
        match name {
            "t0" => self.t0 = value.as_f64(name)?,
            "grid" => self.grid = value.as_floats(name)?,
            "reltol" => self.reltol = value.as_f64(name)?,
            "abstol" => self.abstol = value.as_f64(name)?,
            "abstolv" => self.abstolv = value.as_floats(name)?,
            "max_num_steps" => self.max_num_steps = value.as_usize(name)?,
            "max_multistep_order" => self.max_multistep_order = value.as_usize(name)?,
            "step0" => self.step0 = value.as_f64(name)?,
            "max_step_size" => self.max_step_size = value.as_f64(name)?,
            "constraints" => {
                self.constraints = value
                    .as_ints(name)?
                    .iter()
                    .map(|&c| {
                        i32::try_from(c)
                            .map_err(|_| ConfigError::InvalidValue {
                                name: "constraints",
                                reason: format!("{c} is out of range"),
                            })
                            .and_then(Constraint::try_from)
                    })
                    .collect::<Result<_, _>>()?
            }
            "suppress_algebraic" => self.suppress_algebraic = value.as_bool(name)?,
            "calc_ic" => self.calc_ic = value.as_bool(name)?,
            "calc_icB" => self.calc_icb = Some(value.as_bool(name)?),
            "first_time" => self.first_time = value.as_f64(name)?,
            "cj_scaling" => self.cj_scaling = value.as_bool(name)?,
            "cj_scaling_backward" => self.cj_scaling_backward = value.as_bool(name)?,
            "init_xdot" => self.init_xdot = value.as_floats(name)?,
            "quad_err_con" => self.quad_err_con = value.as_bool(name)?,
            "interpolation_type" => {
                let s = value.as_str(name)?;
                self.interpolation =
                    Interpolation::from_name(s).ok_or_else(|| ConfigError::InvalidValue {
                        name: "interpolation_type",
                        reason: format!("unknown interpolation '{s}'"),
                    })?
            }
            "steps_per_checkpoint" => self.steps_per_checkpoint = value.as_usize(name)?,
            "newton_scheme" => {
                let s = value.as_str(name)?;
                self.newton_scheme =
                    NewtonScheme::from_name(s).ok_or_else(|| ConfigError::InvalidValue {
                        name: "newton_scheme",
                        reason: format!("unknown scheme '{s}'"),
                    })?
            }
            "linear_solver" => {
                let s = value.as_str(name)?;
                self.linear_solver =
                    DirectSolverKind::from_name(s).ok_or_else(|| ConfigError::InvalidValue {
                        name: "linear_solver",
                        reason: format!("unknown linear solver '{s}'"),
                    })?
            }
            "max_krylov" => self.max_krylov = value.as_usize(name)?,
            "use_preconditioner" => self.use_preconditioner = value.as_bool(name)?,
            "second_order_correction" => self.second_order_correction = value.as_bool(name)?,
            "nonlin_conv_coeff" => self.nonlin_conv_coeff = value.as_f64(name)?,
            "n_backward" => self.n_backward = value.as_usize(name)?,
            _ => return Err(ConfigError::UnknownOption(name.to_string())),
        }
        Ok(())
    }

    /// Check the options against the problem sizes.
    pub fn validate(&self, dims: &Dimensions) -> Result<(), ConfigError> {
        let nxz = dims.nxz();
        let invalid = |name: &'static str, reason: &str| ConfigError::InvalidValue {
            name,
            reason: reason.to_string(),
        };

        if self.grid.is_empty() {
            return Err(invalid("grid", "must contain at least the end time"));
        }
        if self.grid.windows(2).any(|w| w[1] <= w[0]) {
            return Err(invalid("grid", "must be strictly increasing"));
        }
        if self.grid[0] < self.t0 || self.tf() <= self.t0 {
            return Err(invalid("grid", "must lie after t0"));
        }
        if !(self.reltol >= 0.0) {
            return Err(invalid("reltol", "must be non-negative"));
        }
        if !(self.abstol > 0.0) {
            return Err(invalid("abstol", "must be positive"));
        }
        for (name, len) in [
            ("abstolv", self.abstolv.len()),
            ("constraints", self.constraints.len()),
            ("init_xdot", self.init_xdot.len()),
        ] {
            if len != 0 && len != nxz {
                return Err(ConfigError::DimensionMismatch {
                    name,
                    expected: nxz,
                    found: len,
                });
            }
        }
        if self.abstolv.iter().any(|&a| !(a > 0.0)) {
            return Err(invalid("abstolv", "entries must be positive"));
        }
        if !(1..=5).contains(&self.max_multistep_order) {
            return Err(invalid("max_multistep_order", "must be between 1 and 5"));
        }
        if self.max_num_steps == 0 {
            return Err(invalid("max_num_steps", "must be positive"));
        }
        if self.steps_per_checkpoint == 0 {
            return Err(invalid("steps_per_checkpoint", "must be positive"));
        }
        if self.max_krylov == 0 {
            return Err(invalid("max_krylov", "must be positive"));
        }
        if !(self.step0 >= 0.0) {
            return Err(invalid("step0", "must be non-negative"));
        }
        if !(self.max_step_size >= 0.0) {
            return Err(invalid("max_step_size", "must be non-negative"));
        }
        if !(self.first_time > 0.0) {
            return Err(invalid("first_time", "must be positive"));
        }
        if !(self.nonlin_conv_coeff > 0.0 && self.nonlin_conv_coeff < 1.0) {
            return Err(invalid("nonlin_conv_coeff", "must lie in (0, 1)"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> Dimensions {
        Dimensions {
            nx: 2,
            nz: 1,
            ..Default::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        let config = DaeConfig::default();
        assert!(config.validate(&dims()).is_ok());
        assert!(config.calc_icb());
        assert_eq!(config.abstol_vector(3), vec![1e-8; 3]);
    }

    #[test]
    fn set_option_by_name() {
        let mut config = DaeConfig::default();
        config.set_option("suppress_algebraic", true).unwrap();
        config.set_option("calc_ic", false).unwrap();
        config.set_option("calc_icB", true).unwrap();
        config.set_option("constraints", vec![1, 0, -2]).unwrap();
        config.set_option("abstolv", vec![1e-6, 1e-7, 1e-8]).unwrap();
        config.set_option("max_step_size", 0.1).unwrap();
        config.set_option("first_time", 0.5).unwrap();
        config.set_option("cj_scaling", false).unwrap();
        config.set_option("init_xdot", vec![1.0, 0.0, 0.0]).unwrap();
        config.set_option("newton_scheme", "bcgstab").unwrap();
        config.set_option("max_krylov", 20).unwrap();
        config.set_option("interpolation_type", "polynomial").unwrap();

        assert!(config.suppress_algebraic);
        assert!(!config.calc_ic);
        assert!(config.calc_icb());
        assert_eq!(
            config.constraints,
            vec![Constraint::NonNegative, Constraint::None, Constraint::Negative]
        );
        assert_eq!(config.newton_scheme, NewtonScheme::Bicgstab);
        assert_eq!(config.interpolation, Interpolation::Polynomial);
        assert_eq!(config.max_krylov, 20);
        assert!(config.validate(&dims()).is_ok());
    }

    #[test]
    fn set_option_rejects_bad_input() {
        let mut config = DaeConfig::default();
        assert!(matches!(
            config.set_option("no_such_option", true),
            Err(ConfigError::UnknownOption(_))
        ));
        assert!(matches!(
            config.set_option("calc_ic", 1.0),
            Err(ConfigError::WrongOptionType { .. })
        ));
        assert!(config.set_option("constraints", vec![3]).is_err());
        assert!(config.set_option("newton_scheme", "lsqr").is_err());
    }

    #[test]
    fn validate_checks_lengths() {
        let mut config = DaeConfig::default();
        config.init_xdot = vec![0.0; 2];
        match config.validate(&dims()) {
            Err(ConfigError::DimensionMismatch {
                name,
                expected,
                found,
            }) => {
                assert_eq!(name, "init_xdot");
                assert_eq!(expected, 3);
                assert_eq!(found, 2);
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut config = DaeConfig::default();
        config.constraints = vec![Constraint::Positive];
        assert!(config.validate(&dims()).is_err());

        let mut config = DaeConfig::default();
        config.grid = vec![0.5, 0.2];
        assert!(config.validate(&dims()).is_err());
    }

    #[test]
    fn first_step_respects_max_step_size() {
        let mut config = DaeConfig::default();
        assert_eq!(config.step0_capped(), None);
        config.step0 = 0.5;
        assert_eq!(config.step0_capped(), Some(0.5));
        config.max_step_size = 0.05;
        assert_eq!(config.step0_capped(), Some(0.05));
        config.step0 = 0.01;
        assert_eq!(config.step0_capped(), Some(0.01));
    }

    #[test]
    fn constraint_codes() {
        for c in [
            Constraint::None,
            Constraint::NonNegative,
            Constraint::NonPositive,
            Constraint::Positive,
            Constraint::Negative,
        ] {
            assert_eq!(Constraint::try_from(c.code()).unwrap(), c);
        }
        assert!(Constraint::NonNegative.is_satisfied(0.0));
        assert!(!Constraint::Positive.is_satisfied(0.0));
        assert!(Constraint::Negative.is_satisfied(-1.0));
    }
}
