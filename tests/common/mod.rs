#![allow(dead_code)]

pub mod boards;
pub mod events;
pub mod kits;

#[allow(unused_imports)]
pub use boards::*;
#[allow(unused_imports)]
pub use events::*;
#[allow(unused_imports)]
pub use kits::*;
