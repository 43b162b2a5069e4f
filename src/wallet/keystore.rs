// Key management

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use rand::rngs::OsRng;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};

use crate::core::{sign, Address, Hash, Transaction};
use crate::error::WalletError;

/// Key pair as written to the keystore file
#[derive(Serialize, Deserialize)]
struct StoredKeyPair {
    secret_key_bytes: [u8; 32],
    address: Address,
}

#[derive(Serialize, Deserialize)]
struct StoredKeystore {
    keys: Vec<StoredKeyPair>,
    default_address: Option<Address>,
}

/// secp256k1 key pair and the address it controls
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
    pub address: Address,
}

impl KeyPair {
    /// Generate a new key pair
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, WalletError> {
        Ok(Self::from_secret_key(SecretKey::from_slice(bytes)?))
    }

    fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = secret_key.public_key(&Secp256k1::signing_only());
        let address = Address::from_public_key(&public_key.serialize());
        Self {
            secret_key,
            public_key,
            address,
        }
    }

    /// Compressed public key (33 bytes)
    pub fn pubkey_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }

    /// DER signature over `hash`
    pub fn sign(&self, hash: &Hash) -> Vec<u8> {
        sign(&self.secret_key, hash)
    }

    pub fn sign_transaction(&self, tx: Transaction) -> Transaction {
        tx.sign(&self.secret_key)
    }

    fn to_stored(&self) -> StoredKeyPair {
        StoredKeyPair {
            secret_key_bytes: self.secret_key.secret_bytes(),
            address: self.address.clone(),
        }
    }
}

/// Keystore - manages multiple key pairs
#[derive(Default)]
pub struct Keystore {
    keys: HashMap<Address, KeyPair>,
    default_address: Option<Address>,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the keystore at `path`, or start an empty one if the file does not exist
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Generate a new address; the first one becomes the default
    pub fn new_address(&mut self) -> Address {
        let keypair = KeyPair::generate();
        let address = keypair.address.clone();

        if self.default_address.is_none() {
            self.default_address = Some(address.clone());
        }

        self.keys.insert(address.clone(), keypair);
        address
    }

    pub fn get_keypair(&self, address: &Address) -> Option<&KeyPair> {
        self.keys.get(address)
    }

    pub fn list_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.keys.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn default_address(&self) -> Option<&Address> {
        self.default_address.as_ref()
    }

    pub fn set_default(&mut self, address: Address) -> Result<(), WalletError> {
        if !self.keys.contains_key(&address) {
            return Err(WalletError::UnknownAddress(address.0));
        }
        self.default_address = Some(address);
        Ok(())
    }

    /// Sign `tx` with the key owning its origin address
    pub fn sign_transaction(&self, tx: Transaction) -> Result<Transaction, WalletError> {
        let keypair = self
            .keys
            .get(tx.origin())
            .ok_or_else(|| WalletError::UnknownAddress(tx.origin().0.clone()))?;
        Ok(keypair.sign_transaction(tx))
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }

    /// Save keystore to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), WalletError> {
        let data = StoredKeystore {
            keys: self.keys.values().map(KeyPair::to_stored).collect(),
            default_address: self.default_address.clone(),
        };
        fs::write(path, serde_json::to_string_pretty(&data)?)?;
        Ok(())
    }

    /// Load keystore from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let json = fs::read_to_string(path)?;
        let data: StoredKeystore = serde_json::from_str(&json)?;

        let mut keys = HashMap::new();
        for stored in data.keys {
            let keypair = KeyPair::from_secret_bytes(&stored.secret_key_bytes)?;
            if keypair.address != stored.address {
                return Err(WalletError::UnknownAddress(stored.address.0));
            }
            keys.insert(keypair.address.clone(), keypair);
        }

        Ok(Self {
            keys,
            default_address: data.default_address,
        })
    }
}
