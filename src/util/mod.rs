pub mod atomic_map;
pub mod sharded_map;
pub mod safe_converter;
