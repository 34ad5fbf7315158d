//! Anti-forensic information splitting.
//!
//! Expands a k-byte secret into k·S bytes of stripe material whose
//! stripes must all survive for the secret to be recoverable: the
//! first S-1 stripes are random, chained through a hash-based
//! diffusion, and the last stripe is the running digest XORed with the
//! secret. Erasing any stripe destroys the secret.

use byteorder::{BigEndian, ByteOrder};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::{
    error::{Error, Result},
    util,
};

/// Diffuse one block: each hash-sized chunk becomes
/// `H(BE32(chunk_index) || chunk)`, the final partial chunk truncated.
fn diffuse<D: Digest>(src: &[u8], dst: &mut [u8]) {
    let chunk_len = <D as Digest>::output_size();
    for (index, (s, d)) in src
        .chunks(chunk_len)
        .zip(dst.chunks_mut(chunk_len))
        .enumerate()
    {
        let mut iv = [0u8; 4];
        BigEndian::write_u32(&mut iv, index as u32);
        let mut hasher = D::new();
        hasher.update(iv);
        hasher.update(s);
        let digest = hasher.finalize();
        d.copy_from_slice(&digest[..d.len()]);
    }
}

fn diffuse_dispatch(hash: &str, src: &[u8], dst: &mut [u8]) -> Result<()> {
    match hash {
        "sha256" => diffuse::<Sha256>(src, dst),
        "sha512" => diffuse::<Sha512>(src, dst),
        other => return Err(Error::UnsupportedHash(other.to_string())),
    }
    Ok(())
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Split `secret` into `stripes` stripes. The output is
/// `secret.len() * stripes` bytes; an empty secret yields an empty
/// buffer.
pub fn split(secret: &[u8], stripes: u32, hash: &str) -> Result<Zeroizing<Vec<u8>>> {
    if stripes == 0 {
        return Err(Error::InvalidSize);
    }
    let k = secret.len();
    let total = util::to_usize(util::mul_u64(util::to_u64(k)?, stripes as u64)?)?;
    let mut out = Zeroizing::new(vec![0u8; total]);
    let mut chain = Zeroizing::new(vec![0u8; k]);
    let mut diffused = Zeroizing::new(vec![0u8; k]);

    for i in 0..stripes as usize - 1 {
        let stripe = &mut out[i * k..(i + 1) * k];
        util::random_bytes(stripe);
        xor_into(&mut chain, stripe);
        diffuse_dispatch(hash, &chain, &mut diffused)?;
        chain.copy_from_slice(&diffused);
    }

    let last = &mut out[(stripes as usize - 1) * k..];
    last.copy_from_slice(&chain);
    xor_into(last, secret);
    Ok(out)
}

/// Recover a `key_len`-byte secret from stripe material produced by
/// [`split`]. The material length must be exactly `key_len * stripes`.
pub fn merge(
    material: &[u8],
    stripes: u32,
    key_len: usize,
    hash: &str,
) -> Result<Zeroizing<Vec<u8>>> {
    if stripes == 0 {
        return Err(Error::InvalidSize);
    }
    let expected = util::to_usize(util::mul_u64(util::to_u64(key_len)?, stripes as u64)?)?;
    if material.len() != expected {
        return Err(Error::InvalidSize);
    }

    let mut chain = Zeroizing::new(vec![0u8; key_len]);
    let mut diffused = Zeroizing::new(vec![0u8; key_len]);
    for i in 0..stripes as usize - 1 {
        xor_into(&mut chain, &material[i * key_len..(i + 1) * key_len]);
        diffuse_dispatch(hash, &chain, &mut diffused)?;
        chain.copy_from_slice(&diffused);
    }

    let mut secret = Zeroizing::new(vec![0u8; key_len]);
    secret.copy_from_slice(&material[(stripes as usize - 1) * key_len..]);
    xor_into(&mut secret, &chain);
    Ok(secret)
}
