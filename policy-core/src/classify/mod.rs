pub mod flow;

pub use flow::FlowClassifier;
