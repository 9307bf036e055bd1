// Identity — stream identities, public keys and local key material

mod keys;
mod store;
mod stream;

pub use keys::LocalKeys;
pub use store::KeyStore;
pub use stream::{
    identity_of, uuid_of, PublicKey, StreamIdentity, MAX_STREAM_NAME_LEN, PUBLIC_KEY_LEN,
    STREAM_NAMESPACE,
};
