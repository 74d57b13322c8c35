pub mod consultation;
pub mod draft;
pub mod enums;

pub use consultation::*;
pub use draft::*;
pub use enums::*;
