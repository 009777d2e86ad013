pub mod loader;
pub mod schema;

pub use loader::{DataLoadError, FlowData, load_flow_data, load_into};
