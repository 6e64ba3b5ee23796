pub mod bench;
pub mod clock;
pub mod probe;
pub mod report;
pub mod resolver;

pub use bench::*;
pub use clock::*;
pub use probe::*;
pub use report::*;
pub use resolver::*;
