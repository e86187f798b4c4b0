pub mod io;
pub mod job;
pub mod partition;
pub mod task;
pub mod workunit;

pub use io::{IoDescriptor, TransferKind};
pub use job::{Job, JobState};
pub use partition::{part_range, PartInfo};
pub use task::{Command, Task, TaskState};
pub use workunit::{WorkState, Workunit, WorkunitId};
