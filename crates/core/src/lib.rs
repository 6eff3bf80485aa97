pub mod config_extensions;
pub mod physical_plan;

pub mod prelude {
    pub use crate::config_extensions::windower_config::WindowerConfig;
    pub use crate::physical_plan::window::{
        OrderingColumn, SortDirection, WindowExec, WindowFunctionConfig, WindowFunctionKind,
        WindowOperatorConfig,
    };
    pub use windower_governor::{GovernorConfig, ResourceGovernor};
}
