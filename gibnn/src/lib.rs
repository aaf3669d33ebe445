pub mod checkpoint;
pub mod cli;
pub mod client;
pub mod error;
pub mod factor;
pub mod free_energy;
pub mod likelihood;
pub mod linalg;
pub mod metrics;
pub mod model;
pub mod network;
pub mod optimization;
pub mod prior;
pub mod pvi;
pub mod server;
pub mod store;

pub use error::PviError;
pub use pvi_data::RandomState;

pub use candle_core;
pub use candle_nn;
