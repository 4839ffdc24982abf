//! Index and directory records
//!
//! The index record is the serialised body of a resource's index
//! block: metadata plus the ordered list of content block digests. A
//! directory body is a sequence of `length(4 LE) | bincode record`
//! entries, each naming another resource.

use crate::error::ResourceError;
use lib_crypto::{Digest, Identity, PublicIdentity};
use serde::{Deserialize, Serialize};

/// Body of an index block
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IndexRecord {
    pub name: String,
    /// Resource kind ("file", "directory", ...)
    pub kind: String,
    /// Total content size in bytes
    pub size: u64,
    /// Content blocks in order
    pub block_digests: Vec<Digest>,
    /// RSA signature by the publishing user, if any
    pub signature: Option<Vec<u8>>,
    /// Key-derivation salt; empty for unencrypted resources
    pub salt: Vec<u8>,
}

impl IndexRecord {
    pub fn encode(&self) -> Result<Vec<u8>, ResourceError> {
        bincode::serialize(self).map_err(|e| ResourceError::InvalidData(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ResourceError> {
        bincode::deserialize(bytes).map_err(|e| ResourceError::InvalidData(e.to_string()))
    }

    /// The bytes covered by the signature: everything but the
    /// signature itself
    fn signed_bytes(&self) -> Result<Vec<u8>, ResourceError> {
        bincode::serialize(&(
            &self.name,
            &self.kind,
            self.size,
            &self.block_digests,
            &self.salt,
        ))
        .map_err(|e| ResourceError::InvalidData(e.to_string()))
    }

    pub fn sign(&mut self, identity: &Identity) -> Result<(), ResourceError> {
        let bytes = self.signed_bytes()?;
        self.signature = Some(identity.sign(&bytes));
        Ok(())
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Verify the signature against a publisher's key
    pub fn check(&self, key: &PublicIdentity) -> Result<(), ResourceError> {
        let Some(signature) = &self.signature else {
            return Err(ResourceError::InvalidData("index record is unsigned".into()));
        };
        let bytes = self.signed_bytes()?;
        key.verify(&bytes, signature)
            .map_err(|e| ResourceError::InvalidData(e.to_string()))
    }
}

/// One entry of a directory body
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DirectoryRecord {
    pub name: String,
    pub kind: String,
    pub size: u64,
    /// Index block digest of the entry's resource
    pub digest: Digest,
    /// Modification time, UTC epoch seconds
    pub time: u64,
}

impl DirectoryRecord {
    /// Append this record to a directory body
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<(), ResourceError> {
        let bytes =
            bincode::serialize(self).map_err(|e| ResourceError::InvalidData(e.to_string()))?;
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&bytes);
        Ok(())
    }

    /// Parse one record from the head of a directory body slice,
    /// returning it and the bytes consumed. None on a clean end.
    pub fn read_from(input: &[u8]) -> Result<Option<(Self, usize)>, ResourceError> {
        if input.is_empty() {
            return Ok(None);
        }
        if input.len() < 4 {
            return Err(ResourceError::InvalidData("truncated directory entry".into()));
        }
        let len = u32::from_le_bytes(input[..4].try_into().expect("fixed slice")) as usize;
        if input.len() < 4 + len {
            return Err(ResourceError::InvalidData("truncated directory entry".into()));
        }
        let record: DirectoryRecord = bincode::deserialize(&input[4..4 + len])
            .map_err(|e| ResourceError::InvalidData(e.to_string()))?;
        Ok(Some((record, 4 + len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::sha256;

    fn sample_index() -> IndexRecord {
        IndexRecord {
            name: "report.pdf".into(),
            kind: "file".into(),
            size: 1000,
            block_digests: vec![sha256(b"b0"), sha256(b"b1")],
            signature: None,
            salt: Vec::new(),
        }
    }

    #[test]
    fn test_index_round_trip() {
        let record = sample_index();
        let decoded = IndexRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_sign_and_check() {
        let identity = Identity::generate_with_bits("signer", 1024).unwrap();
        let mut record = sample_index();
        record.sign(&identity).unwrap();
        record.check(identity.public()).unwrap();

        // Any covered field invalidates the signature
        record.size += 1;
        assert!(record.check(identity.public()).is_err());
    }

    #[test]
    fn test_unsigned_check_fails() {
        let identity = Identity::generate_with_bits("signer", 1024).unwrap();
        assert!(sample_index().check(identity.public()).is_err());
    }

    #[test]
    fn test_directory_body_round_trip() {
        let records = vec![
            DirectoryRecord {
                name: "a.txt".into(),
                kind: "file".into(),
                size: 5,
                digest: sha256(b"a"),
                time: 1700000000,
            },
            DirectoryRecord {
                name: "sub".into(),
                kind: "directory".into(),
                size: 0,
                digest: sha256(b"sub"),
                time: 1700000001,
            },
        ];
        let mut body = Vec::new();
        for record in &records {
            record.write_to(&mut body).unwrap();
        }

        let mut parsed = Vec::new();
        let mut offset = 0;
        while let Some((record, used)) = DirectoryRecord::read_from(&body[offset..]).unwrap() {
            parsed.push(record);
            offset += used;
        }
        assert_eq!(parsed, records);
    }

    #[test]
    fn test_truncated_directory_rejected() {
        let record = DirectoryRecord {
            name: "x".into(),
            kind: "file".into(),
            size: 1,
            digest: sha256(b"x"),
            time: 0,
        };
        let mut body = Vec::new();
        record.write_to(&mut body).unwrap();
        assert!(DirectoryRecord::read_from(&body[..body.len() - 1]).is_err());
    }
}
