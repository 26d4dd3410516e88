//! Embedding BLOB encoding: raw little-endian f32 values.

/// Encode an embedding for storage.
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a stored embedding; `None` if the BLOB length is not a multiple of 4.
pub fn blob_to_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }

    blob.chunks(4)
        .map(|bytes| {
            let arr: [u8; 4] = bytes.try_into().ok()?;
            Some(f32::from_le_bytes(arr))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_preserves_values() {
        let floats: Vec<f32> = (0..1536).map(|i| i as f32 * 0.001 - 0.5).collect();
        let blob = embedding_to_blob(&floats);
        assert_eq!(blob.len(), 1536 * 4);
        assert_eq!(blob_to_embedding(&blob).unwrap(), floats);
    }

    #[test]
    fn test_invalid_length() {
        assert!(blob_to_embedding(&[0u8, 1, 2, 3, 4]).is_none());
    }

    #[test]
    fn test_empty_blob() {
        assert_eq!(blob_to_embedding(&[]), Some(Vec::new()));
    }
}
