pub mod configuration;
pub mod work;
pub mod worker;
