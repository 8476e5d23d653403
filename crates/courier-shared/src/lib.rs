pub mod constants;
pub mod crypto;
pub mod error;
pub mod event;
pub mod identity;
pub mod message;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, EventError, FilterError, IdentityError, MessageError, RelayUrlError};
pub use event::{SignedEvent, UnsignedEvent};
pub use identity::{Identity, Signer};
pub use message::DirectMessage;
pub use protocol::{ClientMessage, Filter, RelayMessage};
pub use types::{ChatId, PublicKey};
