pub mod containers;
pub mod networks;
