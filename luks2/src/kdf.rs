//! Passphrase key derivation.
//!
//! Three algorithms are supported, selected by the metadata tag:
//! PBKDF2 (SHA-256/512), Argon2i and Argon2id. New volumes default to
//! Argon2id; PBKDF2 iteration counts come from a wall-time benchmark.

use std::time::Instant;

use base64::prelude::*;
use sha2::{Sha256, Sha512};
use zeroize::Zeroizing;

use crate::{
    error::{Error, Result},
    metadata::Kdf,
    util,
};

/// Bytes of salt generated for new keyslots and digests.
pub const SALT_LEN: usize = 32;
/// Lower bound on PBKDF2 iterations.
pub const PBKDF2_MIN_ITERATIONS: u32 = 1000;
/// Iteration count used when the benchmark sample is too fast to measure.
const PBKDF2_FALLBACK_ITERATIONS: u32 = 100_000;
/// Iterations per benchmark sample.
const BENCH_ITERATIONS: u32 = 1000;

/// Tunables for building the KDF of a new keyslot.
#[derive(Clone, Debug)]
pub struct KdfOptions {
    /// KDF tag: `pbkdf2`, `argon2i` or `argon2id`.
    pub algorithm: String,
    /// Hash for pbkdf2: `sha256` or `sha512`.
    pub hash: String,
    /// Wall-time budget for the pbkdf2 benchmark, in milliseconds.
    pub iteration_time_ms: u64,
    /// Explicit pbkdf2 iteration count; skips the benchmark.
    pub iterations: Option<u32>,
    /// Argon2 passes.
    pub time: u32,
    /// Argon2 memory in KiB.
    pub memory: u32,
    /// Argon2 lanes, 1..=255.
    pub parallelism: u8,
}

impl Default for KdfOptions {
    fn default() -> Self {
        KdfOptions {
            algorithm: "argon2id".into(),
            hash: "sha256".into(),
            iteration_time_ms: 1000,
            iterations: None,
            time: 4,
            memory: 1048576,
            parallelism: 4,
        }
    }
}

/// Derive `out_len` key bytes from a passphrase and stored KDF params.
pub fn derive(passphrase: &[u8], kdf: &Kdf, out_len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let mut key = Zeroizing::new(vec![0u8; out_len]);
    match kdf {
        Kdf::Pbkdf2 {
            salt,
            hash,
            iterations,
        } => {
            if *iterations == 0 {
                return Err(Error::InvalidKdfParams("pbkdf2 iterations must be positive"));
            }
            let salt = decode_salt(salt)?;
            pbkdf2_derive(hash, passphrase, &salt, *iterations, &mut key)?;
        }
        Kdf::Argon2i {
            salt,
            time,
            memory,
            cpus,
        } => {
            let salt = decode_salt(salt)?;
            argon2_derive(
                argon2::Algorithm::Argon2i,
                passphrase,
                &salt,
                *time,
                *memory,
                *cpus,
                &mut key,
            )?;
        }
        Kdf::Argon2id {
            salt,
            time,
            memory,
            cpus,
        } => {
            let salt = decode_salt(salt)?;
            argon2_derive(
                argon2::Algorithm::Argon2id,
                passphrase,
                &salt,
                *time,
                *memory,
                *cpus,
                &mut key,
            )?;
        }
    }
    Ok(key)
}

/// PBKDF2 with the named hash; also used for master-key digests.
pub fn pbkdf2_derive(
    hash: &str,
    input: &[u8],
    salt: &[u8],
    iterations: u32,
    out: &mut [u8],
) -> Result<()> {
    match hash {
        "sha256" => pbkdf2::pbkdf2_hmac::<Sha256>(input, salt, iterations, out),
        "sha512" => pbkdf2::pbkdf2_hmac::<Sha512>(input, salt, iterations, out),
        other => return Err(Error::UnsupportedHash(other.to_string())),
    }
    Ok(())
}

fn argon2_derive(
    algorithm: argon2::Algorithm,
    passphrase: &[u8],
    salt: &[u8],
    time: u32,
    memory: u32,
    cpus: u32,
    out: &mut [u8],
) -> Result<()> {
    if !(1..=255).contains(&cpus) {
        return Err(Error::InvalidKdfParams("argon2 parallelism must be 1..=255"));
    }
    if time == 0 {
        return Err(Error::InvalidKdfParams("argon2 time must be positive"));
    }
    let params = argon2::Params::new(memory, time, cpus, Some(out.len()))
        .map_err(|_| Error::InvalidKdfParams("argon2 parameters out of range"))?;
    let argon2 = argon2::Argon2::new(algorithm, argon2::Version::V0x13, params);
    argon2
        .hash_password_into(passphrase, salt, out)
        .map_err(|_| Error::InvalidKdfParams("argon2 derivation failed"))
}

fn decode_salt(salt: &str) -> Result<Zeroizing<Vec<u8>>> {
    Ok(Zeroizing::new(BASE64_STANDARD.decode(salt)?))
}

/// Pick a PBKDF2 iteration count whose evaluation takes roughly
/// `target_ms` on this machine, by timing a small sample and scaling
/// linearly. Never below [`PBKDF2_MIN_ITERATIONS`].
pub fn benchmark_pbkdf2(hash: &str, key_size: usize, target_ms: u64) -> Result<u32> {
    let mut out = Zeroizing::new(vec![0u8; key_size]);
    let salt = [0x55u8; SALT_LEN];

    let start = Instant::now();
    pbkdf2_derive(hash, b"benchmark", &salt, BENCH_ITERATIONS, &mut out)?;
    let elapsed_ms = start.elapsed().as_millis();

    if elapsed_ms == 0 {
        return Ok(PBKDF2_FALLBACK_ITERATIONS);
    }
    let scaled = (BENCH_ITERATIONS as u128 * target_ms as u128) / elapsed_ms;
    let scaled = u32::try_from(scaled).unwrap_or(u32::MAX);
    Ok(scaled.max(PBKDF2_MIN_ITERATIONS))
}

/// Build the on-disk KDF record for a new keyslot from the options,
/// generating a fresh random salt.
pub fn build_kdf(options: &KdfOptions, key_size: usize) -> Result<Kdf> {
    let mut salt = [0u8; SALT_LEN];
    util::random_bytes(&mut salt);
    let salt = BASE64_STANDARD.encode(salt);

    match options.algorithm.as_str() {
        "pbkdf2" => {
            if !matches!(options.hash.as_str(), "sha256" | "sha512") {
                return Err(Error::UnsupportedHash(options.hash.clone()));
            }
            let iterations = match options.iterations {
                Some(n) if n >= PBKDF2_MIN_ITERATIONS => n,
                Some(_) => return Err(Error::InvalidKdfParams("pbkdf2 iterations below minimum")),
                None => benchmark_pbkdf2(&options.hash, key_size, options.iteration_time_ms)?,
            };
            Ok(Kdf::Pbkdf2 {
                salt,
                hash: options.hash.clone(),
                iterations,
            })
        }
        "argon2i" => Ok(Kdf::Argon2i {
            salt,
            time: options.time,
            memory: options.memory,
            cpus: options.parallelism as u32,
        }),
        "argon2id" => Ok(Kdf::Argon2id {
            salt,
            time: options.time,
            memory: options.memory,
            cpus: options.parallelism as u32,
        }),
        other => Err(Error::UnsupportedKdf(other.to_string())),
    }
}
