pub mod backend;
pub mod contract;
pub mod error;
pub mod graph;
pub mod tensor;

pub use backend::*;
pub use contract::*;
pub use error::*;
pub use graph::*;
pub use tensor::*;
