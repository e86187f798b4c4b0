use serde::{Deserialize, Serialize};

/// Partition metadata for a data-parallel task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    /// Name of the input the partitioning applies to.
    pub input: String,
    /// Remote index type used to address partitions (e.g. "record").
    pub index: String,
    /// Number of indexable partitions in the input.
    pub total_index: u32,
}

impl PartInfo {
    pub fn new(input: impl Into<String>, index: impl Into<String>, total_index: u32) -> Self {
        Self {
            input: input.into(),
            index: index.into(),
            total_index,
        }
    }
}

/// Compute the contiguous 1-based index range owned by `rank` out of
/// `total_index` partitions split across `total_work` ranks.
///
/// Indexed parts are distributed as evenly as possible: every rank gets
/// `total_index / total_work` parts and the first `total_index % total_work`
/// ranks get one extra. E.g. total_index=10, total_work=4 gives 3,3,2,2.
///
/// Both the server and the worker compute this independently to build the
/// same remote-fetch URL, so it must stay pure and deterministic. Rank 0 is
/// the unpartitioned case and yields an empty range.
pub fn part_range(total_index: u32, total_work: u32, rank: u32) -> String {
    if rank == 0 {
        return String::new();
    }
    let part_size = total_index / total_work;
    let remainder = total_index % total_work;
    let (start, end) = if rank <= remainder {
        let start = (part_size + 1) * (rank - 1) + 1;
        (start, start + part_size)
    } else {
        let start = (part_size + 1) * remainder + part_size * (rank - remainder - 1) + 1;
        (start, start + part_size - 1)
    };
    if start == end {
        format!("{start}")
    } else {
        format!("{start}-{end}")
    }
}
