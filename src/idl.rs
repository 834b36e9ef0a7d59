use dashmap::DashMap;
use flate2::read::ZlibDecoder;
use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};
use solana_sdk::instruction::AccountMeta;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

use crate::error::{NodeError, Result};
use crate::keys;
use crate::rpc::RpcClient;

// ---------------------------------------------------------------------------
// IDL structure

/// Anchor-format interface descriptor: the instructions a program exposes
/// and the layouts of the accounts it owns.
#[derive(Debug, Clone, Deserialize)]
pub struct Idl {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub instructions: Vec<IdlInstruction>,
    #[serde(default)]
    pub accounts: Vec<IdlAccountDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdlInstruction {
    pub name: String,
    #[serde(default)]
    pub accounts: Vec<IdlInstructionAccount>,
    #[serde(default)]
    pub args: Vec<IdlField>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdlInstructionAccount {
    pub name: String,
    #[serde(default, rename = "isMut")]
    pub is_mut: bool,
    #[serde(default, rename = "isSigner")]
    pub is_signer: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdlField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: IdlType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdlAccountDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: IdlTypeDef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdlTypeDef {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub fields: Vec<IdlField>,
}

/// Wire type of one field or argument. Integers are little-endian; a vec
/// is a 4-byte LE count followed by packed elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdlType {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I64,
    PublicKey,
    String,
    Array(Box<IdlType>, usize),
    Vec(Box<IdlType>),
}

impl IdlType {
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(tag) => match tag.as_str() {
                "bool" => Ok(IdlType::Bool),
                "u8" => Ok(IdlType::U8),
                "u16" => Ok(IdlType::U16),
                "u32" => Ok(IdlType::U32),
                "u64" => Ok(IdlType::U64),
                "i64" => Ok(IdlType::I64),
                "publicKey" => Ok(IdlType::PublicKey),
                "string" => Ok(IdlType::String),
                "bytes" => Ok(IdlType::Vec(Box::new(IdlType::U8))),
                other => Err(NodeError::UnknownIdlType(other.to_string())),
            },
            serde_json::Value::Object(map) => {
                if let Some(arr) = map.get("array").and_then(|v| v.as_array()) {
                    let inner = arr
                        .first()
                        .ok_or_else(|| NodeError::UnknownIdlType("array without inner".into()))?;
                    let len = arr
                        .get(1)
                        .and_then(|v| v.as_u64())
                        .ok_or_else(|| NodeError::UnknownIdlType("array without length".into()))?;
                    Ok(IdlType::Array(Box::new(IdlType::from_json(inner)?), len as usize))
                } else if let Some(inner) = map.get("vec") {
                    Ok(IdlType::Vec(Box::new(IdlType::from_json(inner)?)))
                } else {
                    Err(NodeError::UnknownIdlType(value.to_string()))
                }
            }
            other => Err(NodeError::UnknownIdlType(other.to_string())),
        }
    }

    /// Packed size in bytes; `None` for dynamically sized types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            IdlType::Bool | IdlType::U8 => Some(1),
            IdlType::U16 => Some(2),
            IdlType::U32 => Some(4),
            IdlType::U64 | IdlType::I64 => Some(8),
            IdlType::PublicKey => Some(32),
            IdlType::Array(inner, len) => inner.fixed_size().map(|s| s * len),
            IdlType::Vec(_) | IdlType::String => None,
        }
    }
}

impl<'de> Deserialize<'de> for IdlType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        IdlType::from_json(&value).map_err(serde::de::Error::custom)
    }
}

impl Idl {
    pub fn instruction(&self, name: &str) -> Option<&IdlInstruction> {
        self.instructions.iter().find(|i| i.name == name)
    }

    pub fn account_def(&self, name: &str) -> Option<&IdlAccountDef> {
        self.accounts.iter().find(|a| a.name == name)
    }
}

// ---------------------------------------------------------------------------
// Decoded values

/// A decoded field value. Higher layers know the expected shape from the
/// IDL and use the schema-directed accessors.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I64(i64),
    Pubkey(Pubkey),
    String(String),
    Vec(Vec<Value>),
    Array(Vec<Value>),
}

impl Value {
    pub fn from_bytes(bytes: &[u8]) -> Value {
        Value::Array(bytes.iter().map(|b| Value::U8(*b)).collect())
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U8(n) => Some(u64::from(*n)),
            Value::U16(n) => Some(u64::from(*n)),
            Value::U32(n) => Some(u64::from(*n)),
            Value::U64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(n) => Some(*n),
            _ => self.as_u64().and_then(|n| i64::try_from(n).ok()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_pubkey(&self) -> Option<Pubkey> {
        match self {
            Value::Pubkey(key) => Some(*key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn elements(&self) -> Option<&[Value]> {
        match self {
            Value::Vec(items) | Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Array/vec of u8 back into raw bytes.
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        self.elements()?
            .iter()
            .map(|v| match v {
                Value::U8(b) => Some(*b),
                _ => None,
            })
            .collect()
    }
}

/// One decoded account: the type name and its fields in declared order.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAccount {
    pub name: String,
    pub fields: Vec<(String, Value)>,
}

impl DecodedAccount {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn expect(&self, field: &str) -> Result<&Value> {
        self.get(field)
            .ok_or_else(|| NodeError::UnknownIdlType(format!("field `{field}` on `{}`", self.name)))
    }
}

// ---------------------------------------------------------------------------
// Discriminators

/// First 8 bytes of sha256 over "global:" + the method name.
pub fn method_discriminator(name: &str) -> [u8; 8] {
    sighash("global", name)
}

/// First 8 bytes of sha256 over "account:" + the type name.
pub fn account_discriminator(name: &str) -> [u8; 8] {
    sighash("account", name)
}

fn sighash(namespace: &str, name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(format!("{namespace}:{name}").as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

// ---------------------------------------------------------------------------
// Packing

fn encode_value(ty: &IdlType, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    let mismatch = || {
        NodeError::UnknownIdlType(format!("cannot encode {value:?} as {ty:?}"))
    };
    match ty {
        IdlType::Bool => out.push(if value.as_bool().ok_or_else(mismatch)? { 1 } else { 0 }),
        IdlType::U8 => {
            let n = value.as_u64().ok_or_else(mismatch)?;
            out.push(u8::try_from(n).map_err(|_| mismatch())?);
        }
        IdlType::U16 => {
            let n = value.as_u64().ok_or_else(mismatch)?;
            out.extend_from_slice(&u16::try_from(n).map_err(|_| mismatch())?.to_le_bytes());
        }
        IdlType::U32 => {
            let n = value.as_u64().ok_or_else(mismatch)?;
            out.extend_from_slice(&u32::try_from(n).map_err(|_| mismatch())?.to_le_bytes());
        }
        IdlType::U64 => {
            out.extend_from_slice(&value.as_u64().ok_or_else(mismatch)?.to_le_bytes());
        }
        IdlType::I64 => {
            out.extend_from_slice(&value.as_i64().ok_or_else(mismatch)?.to_le_bytes());
        }
        IdlType::PublicKey => {
            out.extend_from_slice(value.as_pubkey().ok_or_else(mismatch)?.as_ref());
        }
        IdlType::String => {
            let s = value.as_str().ok_or_else(mismatch)?;
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        IdlType::Array(inner, len) => {
            let items = value.elements().ok_or_else(mismatch)?;
            if items.len() != *len {
                return Err(NodeError::UnknownIdlType(format!(
                    "array length {} does not match declared {len}",
                    items.len()
                )));
            }
            for item in items {
                encode_value(inner, item, out)?;
            }
        }
        IdlType::Vec(inner) => {
            let items = value.elements().ok_or_else(mismatch)?;
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_value(inner, item, out)?;
            }
        }
    }
    Ok(())
}

fn decode_value(ty: &IdlType, data: &[u8], offset: &mut usize) -> Result<Value> {
    let take = |offset: &mut usize, len: usize| -> Result<std::ops::Range<usize>> {
        let start = *offset;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                NodeError::InvalidAccountData(format!(
                    "truncated at offset {start}, wanted {len} bytes of {}",
                    data.len()
                ))
            })?;
        *offset = end;
        Ok(start..end)
    };
    match ty {
        IdlType::Bool => {
            let range = take(offset, 1)?;
            Ok(Value::Bool(data[range.start] != 0))
        }
        IdlType::U8 => {
            let range = take(offset, 1)?;
            Ok(Value::U8(data[range.start]))
        }
        IdlType::U16 => {
            let range = take(offset, 2)?;
            Ok(Value::U16(u16::from_le_bytes(data[range].try_into().unwrap())))
        }
        IdlType::U32 => {
            let range = take(offset, 4)?;
            Ok(Value::U32(u32::from_le_bytes(data[range].try_into().unwrap())))
        }
        IdlType::U64 => {
            let range = take(offset, 8)?;
            Ok(Value::U64(u64::from_le_bytes(data[range].try_into().unwrap())))
        }
        IdlType::I64 => {
            let range = take(offset, 8)?;
            Ok(Value::I64(i64::from_le_bytes(data[range].try_into().unwrap())))
        }
        IdlType::PublicKey => {
            let range = take(offset, 32)?;
            let bytes: [u8; 32] = data[range].try_into().unwrap();
            Ok(Value::Pubkey(Pubkey::new_from_array(bytes)))
        }
        IdlType::String => {
            let range = take(offset, 4)?;
            let len = u32::from_le_bytes(data[range].try_into().unwrap()) as usize;
            let range = take(offset, len)?;
            let s = std::str::from_utf8(&data[range])
                .map_err(|e| NodeError::InvalidAccountData(format!("bad utf8: {e}")))?;
            Ok(Value::String(s.to_string()))
        }
        IdlType::Array(inner, len) => {
            let mut items = Vec::with_capacity(*len);
            for _ in 0..*len {
                items.push(decode_value(inner, data, offset)?);
            }
            Ok(Value::Array(items))
        }
        IdlType::Vec(inner) => {
            let range = take(offset, 4)?;
            let count = u32::from_le_bytes(data[range].try_into().unwrap()) as usize;
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(decode_value(inner, data, offset)?);
            }
            Ok(Value::Vec(items))
        }
    }
}

// ---------------------------------------------------------------------------
// Codec

/// Per-process IDL codec. Fetched descriptors are memoized per
/// `(program, cluster)` for the life of the process; the cache is
/// insert-if-absent and safe for concurrent readers.
pub struct IdlCodec {
    cluster: String,
    cache: DashMap<(Pubkey, String), Arc<Idl>>,
}

impl IdlCodec {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self { cluster: cluster.into(), cache: DashMap::new() }
    }

    /// Fetch a program's IDL from its deterministic on-chain address,
    /// reading through the cache.
    pub async fn fetch(&self, rpc: &RpcClient, program: &Pubkey) -> Result<Arc<Idl>> {
        let key = (*program, self.cluster.clone());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(Arc::clone(&cached));
        }
        let address = keys::idl_address(program)?;
        let data = rpc
            .get_account_info(&address)
            .await?
            .ok_or(NodeError::IdlUnavailable(*program))?;
        let idl = Arc::new(parse_idl_account(&data, program)?);
        debug!(%program, name = ?idl.name, "idl fetched");
        self.cache.entry(key).or_insert_with(|| Arc::clone(&idl));
        Ok(idl)
    }

    /// Insert a descriptor directly; used by tests and offline tooling.
    pub fn preload(&self, program: &Pubkey, idl: Idl) {
        self.cache
            .insert((*program, self.cluster.clone()), Arc::new(idl));
    }

    /// Scan a program's accounts of one IDL type, filtering on literal
    /// field values. A filter naming an unknown field fails before any
    /// network I/O.
    pub async fn program_accounts(
        &self,
        rpc: &RpcClient,
        program: &Pubkey,
        type_name: &str,
        filters: &[(&str, Value)],
    ) -> Result<Vec<(Pubkey, DecodedAccount)>> {
        let idl = self.fetch(rpc, program).await?;
        let mut memcmp = vec![(
            0usize,
            bs58::encode(account_discriminator(type_name)).into_string(),
        )];
        for (field, value) in filters {
            let (offset, ty) = field_offset(&idl, type_name, field)?;
            let mut bytes = Vec::new();
            encode_value(&ty, value, &mut bytes)?;
            memcmp.push((offset, bs58::encode(bytes).into_string()));
        }
        let raw = rpc.get_program_accounts(program, &memcmp).await?;
        raw.into_iter()
            .map(|(pubkey, data)| Ok((pubkey, decode_account(&idl, type_name, &data)?)))
            .collect()
    }
}

/// On-chain IDL account layout: 8 B discriminator, 32 B authority, 4 B
/// little-endian length, zlib-compressed JSON.
pub fn parse_idl_account(data: &[u8], program: &Pubkey) -> Result<Idl> {
    const HEADER: usize = 8 + 32 + 4;
    if data.len() <= HEADER {
        return Err(NodeError::IdlUnavailable(*program));
    }
    let declared = u32::from_le_bytes(data[40..44].try_into().unwrap()) as usize;
    let end = HEADER + declared.min(data.len() - HEADER);
    let mut json = Vec::new();
    ZlibDecoder::new(&data[HEADER..end])
        .read_to_end(&mut json)
        .map_err(|e| NodeError::InvalidAccountData(format!("idl inflate: {e}")))?;
    Ok(serde_json::from_slice(&json)?)
}

/// Encode an instruction call: 8-byte method discriminator plus packed
/// args, and the ordered account-meta list resolved from `accounts`.
pub fn encode_instruction(
    idl: &Idl,
    name: &str,
    args: &[Value],
    accounts: &HashMap<String, Pubkey>,
) -> Result<(Vec<u8>, Vec<AccountMeta>)> {
    let instruction = idl
        .instruction(name)
        .ok_or_else(|| NodeError::UnknownIdlType(format!("instruction `{name}`")))?;

    let mut metas = Vec::with_capacity(instruction.accounts.len());
    for entry in &instruction.accounts {
        let pubkey = accounts
            .get(&entry.name)
            .ok_or_else(|| NodeError::MissingAccount(entry.name.clone()))?;
        metas.push(if entry.is_mut {
            AccountMeta::new(*pubkey, entry.is_signer)
        } else {
            AccountMeta::new_readonly(*pubkey, entry.is_signer)
        });
    }

    // Packs exactly the args provided. Fewer than declared is legal (the
    // quit path submits `finish` with none); extras have no type to pack
    // against.
    if args.len() > instruction.args.len() {
        return Err(NodeError::UnknownIdlType(format!(
            "instruction `{name}` takes {} args, got {}",
            instruction.args.len(),
            args.len()
        )));
    }
    let mut data = method_discriminator(name).to_vec();
    for (field, value) in instruction.args.iter().zip(args) {
        encode_value(&field.ty, value, &mut data)?;
    }
    Ok((data, metas))
}

/// Decode a typed account blob: verify the 8-byte discriminator, then read
/// fields in declared order.
pub fn decode_account(idl: &Idl, type_name: &str, data: &[u8]) -> Result<DecodedAccount> {
    let def = idl
        .account_def(type_name)
        .ok_or_else(|| NodeError::UnknownIdlType(format!("account type `{type_name}`")))?;
    if data.len() < 8 || data[..8] != account_discriminator(type_name) {
        return Err(NodeError::InvalidAccountData(format!(
            "discriminator mismatch for `{type_name}`"
        )));
    }
    let mut offset = 8;
    let mut fields = Vec::with_capacity(def.ty.fields.len());
    for field in &def.ty.fields {
        let value = decode_value(&field.ty, data, &mut offset)?;
        fields.push((field.name.clone(), value));
    }
    Ok(DecodedAccount { name: type_name.to_string(), fields })
}

/// Re-pack a decoded account into its on-chain byte layout.
pub fn encode_account(idl: &Idl, account: &DecodedAccount) -> Result<Vec<u8>> {
    let def = idl
        .account_def(&account.name)
        .ok_or_else(|| NodeError::UnknownIdlType(format!("account type `{}`", account.name)))?;
    let mut data = account_discriminator(&account.name).to_vec();
    for field in &def.ty.fields {
        let value = account.expect(&field.name)?;
        encode_value(&field.ty, value, &mut data)?;
    }
    Ok(data)
}

/// Byte offset of a field within an account layout (discriminator
/// included), for memcmp filters. Fails on unknown fields and on fields
/// behind a dynamically sized one.
pub fn field_offset(idl: &Idl, type_name: &str, field_name: &str) -> Result<(usize, IdlType)> {
    let def = idl
        .account_def(type_name)
        .ok_or_else(|| NodeError::UnknownIdlType(format!("account type `{type_name}`")))?;
    let mut offset = 8;
    for field in &def.ty.fields {
        if field.name == field_name {
            return Ok((offset, field.ty.clone()));
        }
        offset += field.ty.fixed_size().ok_or_else(|| {
            NodeError::UnknownIdlType(format!(
                "field `{field_name}` sits behind dynamically sized `{}`",
                field.name
            ))
        })?;
    }
    Err(NodeError::UnknownIdlType(format!(
        "field `{field_name}` not in `{type_name}`"
    )))
}
