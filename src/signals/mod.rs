pub mod forecaster;
pub mod impulse;
pub mod monte_carlo;
pub mod scoring;
