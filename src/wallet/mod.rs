// Wallet: keys used to sign transactions

mod keystore;

pub use keystore::{KeyPair, Keystore};
