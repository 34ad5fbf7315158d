//! Token table CRUD.
//!
//! Tokens are opaque JSON objects (FIDO2, TPM2, ...) stored in the
//! header next to the keyslots. Only `type` and `keyslots` are
//! interpreted; everything else is preserved verbatim across header
//! rewrites.

use std::path::Path;

use crate::{
    device::open_container,
    error::{Error, Result},
    header,
    lock,
    metadata::{Token, MAX_SLOTS},
};

fn check_id(id: u8) -> Result<()> {
    if id >= MAX_SLOTS {
        return Err(Error::InvalidToken("token id out of range"));
    }
    Ok(())
}

fn validate(token: &Token) -> Result<()> {
    if token.token_type.is_empty() {
        return Err(Error::InvalidToken("token type must not be empty"));
    }
    Ok(())
}

/// Fetch one token.
pub fn get(device: &Path, id: u8) -> Result<Token> {
    check_id(id)?;
    let dev = open_container(device, false)?;
    let (_, metadata, _) = header::read_header(&dev)?;
    metadata.tokens.get(&id).cloned().ok_or(Error::TokenNotFound(id))
}

/// All tokens, in id order.
pub fn list(device: &Path) -> Result<Vec<(u8, Token)>> {
    let dev = open_container(device, false)?;
    let (_, metadata, _) = header::read_header(&dev)?;
    Ok(metadata.tokens.into_iter().collect())
}

/// Pretty-printed JSON form of one token.
pub fn export(device: &Path, id: u8) -> Result<String> {
    let token = get(device, id)?;
    serde_json::to_string_pretty(&token).map_err(|err| Error::MalformedMetadata(err.to_string()))
}

/// Store a token, either at the requested id (which must be free) or
/// at the lowest free id. Returns the id used.
pub fn import(device: &Path, id: Option<u8>, token: &Token) -> Result<u8> {
    validate(token)?;
    let dev = open_container(device, true)?;
    let _guard = lock::exclusive(dev.file())?;
    let (mut bin, mut metadata, _) = header::read_header(&dev)?;

    let id = match id {
        Some(id) => {
            check_id(id)?;
            if metadata.tokens.contains_key(&id) {
                return Err(Error::InvalidToken("token id already in use"));
            }
            id
        }
        None => metadata.free_token()?,
    };
    // Keyslot references are not resolved here: a token may describe a
    // slot that will only be provisioned later.
    metadata.tokens.insert(id, token.clone());

    bin.sequence_id += 1;
    header::write_headers(&dev, &mut bin, &metadata)?;
    Ok(id)
}

/// Like [`import`], parsing the token from a JSON string first.
pub fn import_json(device: &Path, id: Option<u8>, json: &str) -> Result<u8> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|_| Error::InvalidToken("token is not valid JSON"))?;
    if value.is_null() {
        return Err(Error::InvalidToken("token must not be null"));
    }
    let token: Token = serde_json::from_value(value)
        .map_err(|_| Error::InvalidToken("token must carry a type and keyslot list"))?;
    import(device, id, &token)
}

/// Delete a token.
pub fn remove(device: &Path, id: u8) -> Result<()> {
    check_id(id)?;
    let dev = open_container(device, true)?;
    let _guard = lock::exclusive(dev.file())?;
    let (mut bin, mut metadata, _) = header::read_header(&dev)?;

    if metadata.tokens.remove(&id).is_none() {
        return Err(Error::TokenNotFound(id));
    }
    bin.sequence_id += 1;
    header::write_headers(&dev, &mut bin, &metadata)
}

/// Lowest free token id.
pub fn find_free_slot(device: &Path) -> Result<u8> {
    let dev = open_container(device, false)?;
    let (_, metadata, _) = header::read_header(&dev)?;
    metadata.free_token()
}

/// Whether a token with the given id exists.
pub fn exists(device: &Path, id: u8) -> Result<bool> {
    check_id(id)?;
    let dev = open_container(device, false)?;
    let (_, metadata, _) = header::read_header(&dev)?;
    Ok(metadata.tokens.contains_key(&id))
}

/// Number of stored tokens.
pub fn count(device: &Path) -> Result<usize> {
    let dev = open_container(device, false)?;
    let (_, metadata, _) = header::read_header(&dev)?;
    Ok(metadata.tokens.len())
}
