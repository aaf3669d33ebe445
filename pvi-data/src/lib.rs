pub mod common_io;
pub mod dgp;
pub mod minibatch;
pub mod random_state;
pub mod split;

pub use random_state::RandomState;
