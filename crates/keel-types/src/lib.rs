pub mod concurrency;
pub mod effect;
pub mod error;
pub mod instruction;
pub mod scheduler;
pub mod stream;

pub use concurrency::{Await, Queue, Ref};
pub use effect::Effect;
pub use error::{Defect, Failure};
pub use instruction::{AnyValue, Instruction};
pub use scheduler::{CancelToken, Scheduler};
pub use stream::{Emitter, Stream};
