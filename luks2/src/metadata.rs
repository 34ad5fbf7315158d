//! LUKS2 JSON metadata model.
//!
//! The JSON area carries five top-level members: `keyslots`, `tokens`,
//! `segments`, `digests` and `config`. Sizes and offsets are encoded as
//! decimal strings; `sector_size`, `stripes` and `iterations` are plain
//! JSON numbers and `segment.size` may be the literal `"dynamic"`.

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use serde::{de, ser::SerializeSeq, Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    error::{Error, Result},
    util,
};

/// Highest keyslot (and token) identifier.
pub const MAX_SLOTS: u8 = 32;
/// Number of anti-forensic stripes in every keyslot.
pub const AF_STRIPES: u16 = 4000;
/// Alignment of keyslot areas.
pub const AREA_ALIGN: u64 = 4096;
/// First byte usable for keyslot areas.
pub const AREA_OFFSET: u64 = 0x8000;
/// Reserved byte span for keyslot areas, ending at the data segment.
pub const KEYSLOTS_SIZE: u64 = 16744448;
/// Cipher used for both keyslot areas and the data segment.
pub const CIPHER: &str = "aes-xts-plain64";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    #[serde(deserialize_with = "serde_with::rust::maps_duplicate_key_is_error::deserialize")]
    pub keyslots: BTreeMap<u8, Keyslot>,
    #[serde(
        default,
        deserialize_with = "serde_with::rust::maps_duplicate_key_is_error::deserialize"
    )]
    pub tokens: BTreeMap<u8, Token>,
    #[serde(deserialize_with = "serde_with::rust::maps_duplicate_key_is_error::deserialize")]
    pub segments: BTreeMap<u8, Segment>,
    #[serde(deserialize_with = "serde_with::rust::maps_duplicate_key_is_error::deserialize")]
    pub digests: BTreeMap<u8, Digest>,
    pub config: Config,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Keyslot {
    #[serde(rename = "luks2")]
    Luks2 {
        key_size: u16,
        area: Area,
        kdf: Kdf,
        af: Af,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_priority",
            serialize_with = "serialize_priority"
        )]
        priority: Option<Priority>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Area {
    #[serde(rename = "raw")]
    Raw {
        encryption: String,
        key_size: u32,
        #[serde(deserialize_with = "from_str", serialize_with = "to_str")]
        offset: u64,
        #[serde(deserialize_with = "from_str", serialize_with = "to_str")]
        size: u64,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Kdf {
    #[serde(rename = "pbkdf2")]
    Pbkdf2 {
        salt: String,
        hash: String,
        iterations: u32,
    },

    #[serde(rename = "argon2i")]
    Argon2i {
        salt: String,
        time: u32,
        memory: u32,
        cpus: u32,
    },

    #[serde(rename = "argon2id")]
    Argon2id {
        salt: String,
        time: u32,
        memory: u32,
        cpus: u32,
    },
}

impl Kdf {
    /// The `type` tag of this KDF.
    pub fn kind(&self) -> &'static str {
        match self {
            Kdf::Pbkdf2 { .. } => "pbkdf2",
            Kdf::Argon2i { .. } => "argon2i",
            Kdf::Argon2id { .. } => "argon2id",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Af {
    #[serde(rename = "luks1")]
    Luks1 { stripes: u16, hash: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum Priority {
    Ignore,
    Normal,
    High,
}

/// An opaque token object. `type` and `keyslots` are validated; all
/// remaining attributes are preserved verbatim.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Token {
    #[serde(rename = "type")]
    pub token_type: String,
    #[serde(deserialize_with = "vec_from_str", serialize_with = "vec_to_str")]
    pub keyslots: Vec<u8>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Segment {
    #[serde(rename = "crypt")]
    Crypt {
        #[serde(deserialize_with = "from_str", serialize_with = "to_str")]
        offset: u64,
        #[serde(
            deserialize_with = "deserialize_segment_size",
            serialize_with = "serialize_segment_size"
        )]
        size: SegmentSize,
        #[serde(deserialize_with = "from_str", serialize_with = "to_str")]
        iv_tweak: u64,
        encryption: String,
        sector_size: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flags: Option<Vec<String>>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SegmentSize {
    /// Extends to the end of the container.
    Dynamic,
    Fixed(u64),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Digest {
    #[serde(rename = "pbkdf2")]
    Pbkdf2 {
        #[serde(deserialize_with = "vec_from_str", serialize_with = "vec_to_str")]
        keyslots: Vec<u8>,
        #[serde(deserialize_with = "vec_from_str", serialize_with = "vec_to_str")]
        segments: Vec<u8>,
        salt: String,
        digest: String,
        hash: String,
        iterations: u32,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(deserialize_with = "from_str", serialize_with = "to_str")]
    pub json_size: u64,
    #[serde(deserialize_with = "from_str", serialize_with = "to_str")]
    pub keyslots_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Vec<String>>,
}

fn from_str<'de, T, D>(deserializer: D) -> std::result::Result<T, D::Error>
where
    T: FromStr,
    T::Err: Display,
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    T::from_str(&s).map_err(de::Error::custom)
}

fn to_str<T, S>(value: &T, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    T: Display,
    S: Serializer,
{
    serializer.collect_str(value)
}

fn vec_from_str<'de, T, D>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    T: FromStr,
    T::Err: Display,
    D: Deserializer<'de>,
{
    let v = Vec::<String>::deserialize(deserializer)?;
    v.iter()
        .map(|s| T::from_str(s).map_err(de::Error::custom))
        .collect()
}

fn vec_to_str<T, S>(values: &[T], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    T: Display,
    S: Serializer,
{
    let mut seq = serializer.serialize_seq(Some(values.len()))?;
    for value in values {
        seq.serialize_element(&value.to_string())?;
    }
    seq.end()
}

fn deserialize_priority<'de, D>(deserializer: D) -> std::result::Result<Option<Priority>, D::Error>
where
    D: Deserializer<'de>,
{
    let p = match Option::<i32>::deserialize(deserializer)? {
        Some(pr) => pr,
        None => return Ok(None),
    };
    match p {
        0 => Ok(Some(Priority::Ignore)),
        1 => Ok(Some(Priority::Normal)),
        2 => Ok(Some(Priority::High)),
        _ => Err(de::Error::custom(format!("invalid priority {p}"))),
    }
}

fn serialize_priority<S>(
    priority: &Option<Priority>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match priority {
        Some(Priority::Ignore) => serializer.serialize_i32(0),
        Some(Priority::Normal) => serializer.serialize_i32(1),
        Some(Priority::High) => serializer.serialize_i32(2),
        None => serializer.serialize_none(),
    }
}

fn deserialize_segment_size<'de, D>(
    deserializer: D,
) -> std::result::Result<SegmentSize, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    match s.as_str() {
        "dynamic" => Ok(SegmentSize::Dynamic),
        x => Ok(SegmentSize::Fixed(
            u64::from_str(x).map_err(de::Error::custom)?,
        )),
    }
}

fn serialize_segment_size<S>(
    size: &SegmentSize,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match size {
        SegmentSize::Dynamic => serializer.serialize_str("dynamic"),
        SegmentSize::Fixed(n) => serializer.collect_str(n),
    }
}

impl Keyslot {
    pub fn key_size(&self) -> u16 {
        match self {
            Keyslot::Luks2 { key_size, .. } => *key_size,
        }
    }

    pub fn area(&self) -> &Area {
        match self {
            Keyslot::Luks2 { area, .. } => area,
        }
    }

    pub fn kdf(&self) -> &Kdf {
        match self {
            Keyslot::Luks2 { kdf, .. } => kdf,
        }
    }

    pub fn af(&self) -> &Af {
        match self {
            Keyslot::Luks2 { af, .. } => af,
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Keyslot::Luks2 { priority, .. } => priority.unwrap_or(Priority::Normal),
        }
    }
}

impl Area {
    pub fn offset(&self) -> u64 {
        match self {
            Area::Raw { offset, .. } => *offset,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Area::Raw { size, .. } => *size,
        }
    }

    pub fn encryption(&self) -> &str {
        match self {
            Area::Raw { encryption, .. } => encryption,
        }
    }
}

impl Metadata {
    /// Parse and semantically validate a JSON metadata area.
    pub fn from_json(data: &str) -> Result<Self> {
        let meta: Metadata = serde_json::from_str(data)
            .map_err(|err| Error::MalformedMetadata(err.to_string()))?;
        meta.validate()?;
        Ok(meta)
    }

    /// Marshal to the compact JSON form stored on disk.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| Error::MalformedMetadata(err.to_string()))
    }

    /// Enforce the structural invariants that hold between operations.
    pub fn validate(&self) -> Result<()> {
        if self.keyslots.is_empty() {
            return Err(Error::MalformedMetadata("no keyslots".into()));
        }

        for (id, slot) in &self.keyslots {
            if *id >= MAX_SLOTS {
                return Err(Error::MalformedMetadata(format!("keyslot {id} out of range")));
            }
            let area = slot.area();
            if area.offset() < AREA_OFFSET || area.offset() % AREA_ALIGN != 0 {
                return Err(Error::MalformedMetadata(format!(
                    "keyslot {id} area at misaligned offset {}",
                    area.offset()
                )));
            }
            let Af::Luks1 { stripes, .. } = slot.af();
            let material = util::mul_u64(slot.key_size() as u64, *stripes as u64)?;
            if material > area.size() {
                return Err(Error::MalformedMetadata(format!(
                    "keyslot {id} key material exceeds its area"
                )));
            }
        }

        if self.segments.is_empty() {
            return Err(Error::MalformedMetadata("no crypt segment".into()));
        }
        for (id, Segment::Crypt { sector_size, .. }) in &self.segments {
            if !matches!(*sector_size, 512 | 4096) {
                return Err(Error::MalformedMetadata(format!(
                    "segment {id} has invalid sector size {sector_size}"
                )));
            }
        }

        if self.digests.is_empty() {
            return Err(Error::MalformedMetadata("no digests".into()));
        }
        for (id, Digest::Pbkdf2 { keyslots, segments, .. }) in &self.digests {
            if !keyslots.iter().all(|k| self.keyslots.contains_key(k)) {
                return Err(Error::MalformedMetadata(format!(
                    "digest {id} references a missing keyslot"
                )));
            }
            if !segments.iter().all(|s| self.segments.contains_key(s)) {
                return Err(Error::MalformedMetadata(format!(
                    "digest {id} references a missing segment"
                )));
            }
        }

        // Every active keyslot must be covered by a digest.
        for id in self.keyslots.keys() {
            let covered = self
                .digests
                .values()
                .any(|Digest::Pbkdf2 { keyslots, .. }| keyslots.contains(id));
            if !covered {
                return Err(Error::MalformedMetadata(format!(
                    "keyslot {id} is not covered by any digest"
                )));
            }
        }

        for id in self.tokens.keys() {
            if *id >= MAX_SLOTS {
                return Err(Error::MalformedMetadata(format!("token {id} out of range")));
            }
        }

        Ok(())
    }

    /// Lowest unused keyslot id.
    pub fn free_keyslot(&self) -> Result<u8> {
        (0..MAX_SLOTS)
            .find(|id| !self.keyslots.contains_key(id))
            .ok_or(Error::InvalidKeyslot(MAX_SLOTS))
    }

    /// Lowest unused token id.
    pub fn free_token(&self) -> Result<u8> {
        (0..MAX_SLOTS)
            .find(|id| !self.tokens.contains_key(id))
            .ok_or(Error::InvalidToken("token table is full"))
    }

    /// Offset for the next keyslot area: the 4 KiB alignment of the end
    /// of the last existing area, or the start of the keyslot region.
    pub fn next_area_offset(&self) -> Result<u64> {
        let mut end = AREA_OFFSET;
        for slot in self.keyslots.values() {
            let area_end = util::add_u64(slot.area().offset(), slot.area().size())?;
            end = end.max(area_end);
        }
        util::align_up(end, AREA_ALIGN)
    }

    /// First byte of the data segment; keyslot areas must stay below it.
    pub fn data_offset(&self) -> Result<u64> {
        let (_, segment) = self.crypt_segment()?;
        let Segment::Crypt { offset, .. } = segment;
        Ok(*offset)
    }

    /// The crypt segment holding the data (the lowest-numbered one).
    pub fn crypt_segment(&self) -> Result<(u8, &Segment)> {
        self.segments
            .iter()
            .next()
            .map(|(id, seg)| (*id, seg))
            .ok_or_else(|| Error::MalformedMetadata("no crypt segment".into()))
    }

    /// Insert `slot_id` into every digest's keyslot list.
    pub fn cover_keyslot(&mut self, slot_id: u8) {
        for Digest::Pbkdf2 { keyslots, .. } in self.digests.values_mut() {
            if !keyslots.contains(&slot_id) {
                keyslots.push(slot_id);
                keyslots.sort_unstable();
            }
        }
    }

    /// Remove `slot_id` from every digest's keyslot list.
    pub fn uncover_keyslot(&mut self, slot_id: u8) {
        for Digest::Pbkdf2 { keyslots, .. } in self.digests.values_mut() {
            keyslots.retain(|id| *id != slot_id);
        }
    }

    /// Keyslot ids ordered for unlock attempts: high priority first,
    /// ignore-priority slots excluded.
    pub fn unlock_order(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self
            .keyslots
            .iter()
            .filter(|(_, slot)| slot.priority() != Priority::Ignore)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_by_key(|id| (std::cmp::Reverse(self.keyslots[id].priority()), *id));
        ids
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const METADATA_VALID: &str = r#"{
      "keyslots":{
        "0":{
          "type":"luks2",
          "key_size":64,
          "af":{
            "type":"luks1",
            "stripes":4000,
            "hash":"sha256"
          },
          "area":{
            "type":"raw",
            "offset":"32768",
            "size":"258048",
            "encryption":"aes-xts-plain64",
            "key_size":64
          },
          "kdf":{
            "type":"argon2id",
            "time":4,
            "memory":1048576,
            "cpus":4,
            "salt":"VaeYp2RiRvTZLqKxggLfN2owbhkNSB9H6yGDhI9d6ko="
          }
        }
      },
      "tokens":{},
      "segments":{
        "0":{
          "type":"crypt",
          "offset":"16777216",
          "size":"dynamic",
          "iv_tweak":"0",
          "encryption":"aes-xts-plain64",
          "sector_size":512
        }
      },
      "digests":{
        "0":{
          "type":"pbkdf2",
          "keyslots":["0"],
          "segments":["0"],
          "hash":"sha256",
          "iterations":84344,
          "salt":"CakmJdYBkOgwCHVkoMjUGEQTnNZjym0pa1hl8nWPauM=",
          "digest":"0psj0pfQ4uHA/i/sF2/HUxZnhdO8f1c3GDRuikoZx+Q="
        }
      },
      "config":{
        "json_size":"12288",
        "keyslots_size":"16744448"
      }
    }"#;

    #[test]
    fn test_parse_valid_metadata() {
        let meta = Metadata::from_json(METADATA_VALID).expect("valid metadata should parse");
        assert_eq!(meta.keyslots.len(), 1);
        assert_eq!(meta.keyslots[&0].key_size(), 64);
        assert_eq!(meta.keyslots[&0].area().offset(), 32768);
        assert_eq!(meta.config.keyslots_size, 16744448);

        let (_, Segment::Crypt { offset, size, .. }) = meta.crypt_segment().unwrap();
        assert_eq!(*offset, 16777216);
        assert_eq!(*size, SegmentSize::Dynamic);
    }

    #[test]
    fn test_roundtrip_preserves_string_encoding() {
        let meta = Metadata::from_json(METADATA_VALID).unwrap();
        let json = meta.to_json().unwrap();

        // Numeric offsets and sizes must stay decimal strings, the
        // dynamic size literal, and counts plain numbers.
        assert!(json.contains(r#""offset":"32768""#));
        assert!(json.contains(r#""size":"dynamic""#));
        assert!(json.contains(r#""iterations":84344"#));
        assert!(json.contains(r#""stripes":4000"#));
        assert!(json.contains(r#""keyslots":["0"]"#));

        let reparsed = Metadata::from_json(&json).unwrap();
        assert_eq!(meta, reparsed);
    }

    #[test]
    fn test_duplicate_keyslot_rejected() {
        let doubled = METADATA_VALID.replace(
            r#""keyslots":{
        "0":{"#,
            r#""keyslots":{
        "0":{"type":"luks2","key_size":64,
          "af":{"type":"luks1","stripes":4000,"hash":"sha256"},
          "area":{"type":"raw","offset":"32768","size":"258048","encryption":"aes-xts-plain64","key_size":64},
          "kdf":{"type":"pbkdf2","hash":"sha256","iterations":1000,"salt":"AAAA"}},
        "0":{"#,
        );
        assert!(Metadata::from_json(&doubled).is_err());
    }

    #[test]
    fn test_digest_reference_validation() {
        let broken = METADATA_VALID.replace(r#""keyslots":["0"]"#, r#""keyslots":["7"]"#);
        assert!(matches!(
            Metadata::from_json(&broken),
            Err(Error::MalformedMetadata(_))
        ));
    }

    #[test]
    fn test_uncovered_keyslot_rejected() {
        let broken = METADATA_VALID.replace(r#""keyslots":["0"]"#, r#""keyslots":[]"#);
        assert!(matches!(
            Metadata::from_json(&broken),
            Err(Error::MalformedMetadata(_))
        ));
    }

    #[test]
    fn test_free_slot_and_area_placement() {
        let mut meta = Metadata::from_json(METADATA_VALID).unwrap();
        assert_eq!(meta.free_keyslot().unwrap(), 1);
        assert_eq!(meta.free_token().unwrap(), 0);
        // 32768 + 258048 is already 4 KiB aligned.
        assert_eq!(meta.next_area_offset().unwrap(), 32768 + 258048);

        meta.cover_keyslot(3);
        let Digest::Pbkdf2 { keyslots, .. } = &meta.digests[&0];
        assert_eq!(keyslots, &vec![0, 3]);
        meta.uncover_keyslot(3);
        let Digest::Pbkdf2 { keyslots, .. } = &meta.digests[&0];
        assert_eq!(keyslots, &vec![0]);
    }

    #[test]
    fn test_unlock_order_honours_priority() {
        let mut meta = Metadata::from_json(METADATA_VALID).unwrap();
        let mut high = meta.keyslots[&0].clone();
        let Keyslot::Luks2 { priority, .. } = &mut high;
        *priority = Some(Priority::High);
        meta.keyslots.insert(2, high);

        let mut ignored = meta.keyslots[&0].clone();
        let Keyslot::Luks2 { priority, .. } = &mut ignored;
        *priority = Some(Priority::Ignore);
        meta.keyslots.insert(1, ignored);

        assert_eq!(meta.unlock_order(), vec![2, 0]);
    }
}
