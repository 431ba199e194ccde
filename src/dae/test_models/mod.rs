pub mod decay_with_algebraic;
pub mod exponential_decay;
pub mod exponential_decay_sens;
