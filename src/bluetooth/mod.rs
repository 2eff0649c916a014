pub mod radio;
pub mod scanner;

pub use radio::{BluerRadio, Radio};
pub use scanner::{AdvertisementSource, DEFAULT_COOLDOWN};
