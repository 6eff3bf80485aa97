use datafusion::common::extensions_options;
use datafusion::config::ConfigExtension;

extensions_options! {
    pub struct WindowerConfig {
        /// Every buffered append goes to disk instead of memory.
        pub force_disk_spill: bool, default = false
        /// Peer group sizes per buffered batch of a relative rank function.
        pub peer_group_batch_size: usize, default = 1024
    }
}

impl ConfigExtension for WindowerConfig {
    const PREFIX: &'static str = "windower_config";
}
