pub mod metric_map;
pub mod unit;
pub mod usage;
pub mod value;

pub use metric_map::{sanitize, MetricMap, TotalTimeSeconds};
pub use unit::{ClusterUnits, Unit};
pub use usage::{dedup_sorted, AdminUsers, ClusterProjects, ClusterUsers, Project, Usage, User};
pub use value::{Allocation, Tags, Value};
