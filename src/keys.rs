use once_cell::sync::Lazy;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use std::str::FromStr;

use crate::error::{NodeError, Result};

static METAPLEX_PROGRAM: Lazy<Pubkey> =
    Lazy::new(|| Pubkey::from_str("metaqbxxUerdq28cj1RbAWkYQm3ybzjb6a8bt518x1s").unwrap());

/// Metaplex token-metadata program.
pub fn metaplex_program() -> Pubkey {
    *METAPLEX_PROGRAM
}

/// Program-derived address for the given seeds: the bump search from 255
/// down to the first off-curve result. Exhaustion is cryptographically
/// unreachable but still typed.
pub fn find_pda(seeds: &[&[u8]], program: &Pubkey) -> Result<(Pubkey, u8)> {
    Pubkey::try_find_program_address(seeds, program).ok_or(NodeError::NoValidBump)
}

/// Canonical associated token account for `(owner, mint)`.
pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    spl_associated_token_account::get_associated_token_address(owner, mint)
}

/// Metaplex metadata PDA of an NFT mint.
pub fn metadata_address(mint: &Pubkey) -> Result<Pubkey> {
    let program = metaplex_program();
    let (address, _) = find_pda(
        &[b"metadata", program.as_ref(), mint.as_ref()],
        &program,
    )?;
    Ok(address)
}

/// Anchor IDL account address: sha256 over base + "anchor:idl" + program,
/// where base is the program's empty-seed PDA.
pub fn idl_address(program: &Pubkey) -> Result<Pubkey> {
    let (base, _) = find_pda(&[], program)?;
    Pubkey::create_with_seed(&base, "anchor:idl", program)
        .map_err(|e| NodeError::InvalidAccountData(format!("idl address: {e}")))
}

/// ed25519 signature over an arbitrary message; 64 bytes,
/// base58-displayable.
pub fn sign_message(keypair: &Keypair, message: &[u8]) -> Signature {
    keypair.sign_message(message)
}
