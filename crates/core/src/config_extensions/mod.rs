pub mod windower_config;
