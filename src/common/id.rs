//! Node Id or a DHT key
use rand::Rng;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use crate::{Error, Result};

/// The size of node ids and keys in bytes.
pub const ID_SIZE: usize = 32;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash, Default)]
/// Node Id or a DHT key (query target)
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::Parameter("id must be 32 bytes"));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.clone_from_slice(bytes);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Id {
    type Err = Error;

    /// Parse the hex form printed by [Display].
    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::Parameter("id must be 64 hex characters"));
        }

        let mut bytes = [0u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::Parameter("id must be 64 hex characters"))?;
        }

        Ok(Id(bytes))
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to tell peers apart in logs.
        write!(f, "Id(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}
