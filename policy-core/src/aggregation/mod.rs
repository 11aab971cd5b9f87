pub mod label;
pub mod path;
pub mod port;

pub use label::LabelAggregator;
pub use path::PathAggregator;
pub use port::PortMerger;
