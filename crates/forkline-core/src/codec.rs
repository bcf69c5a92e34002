//! Binary layouts for transactions, signatures, and persisted records.
//!
//! Transaction bodies are little-endian and are what the txid hashes.
//! Persisted tx and block records put a big-endian header in front of the
//! body so that stored values stay self-describing.
//!
//! Tx body layout:
//!
//! | field | size |
//! |-------|------|
//! | version, type, time, deadline | 4 × u32 |
//! | gas_price | u64 |
//! | gas_amount | i64 |
//! | message_type, input_count, output_count | 3 × u8 |
//! | message_len | u32 |
//! | inputs | count × (32-byte hash, u8 index) |
//! | outputs | count × (40-byte address, u32 coin id, u64 amount) |
//! | message | message_len |

use crate::constants::ADDRESS_LEN;
use crate::error::FormatError;
use crate::types::{
    Address, BlockHeader, Consensus, Hash256, MessageType, SignaturePair, Transaction, TxInput,
    TxOutput, TxType,
};

pub const TX_HEADER_LEN: usize = 39;
pub const TX_INPUT_LEN: usize = 33;
pub const TX_OUTPUT_LEN: usize = ADDRESS_LEN + 12;
pub const SIGNATURE_PAIR_LEN: usize = 96;
pub const TX_RECORD_HEADER_LEN: usize = 16;
pub const BLOCK_RECORD_HEADER_LEN: usize = 4 + 4 + 32 + BlockHeader::SIZE + 1 + 4;

/// Bounds-checked cursor over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(FormatError::Truncated { needed: n, available });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    fn u32_le(&mut self) -> Result<u32, FormatError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u32_be(&mut self) -> Result<u32, FormatError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64_le(&mut self) -> Result<u64, FormatError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64_le(&mut self) -> Result<i64, FormatError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn hash(&mut self) -> Result<Hash256, FormatError> {
        Ok(Hash256(self.array()?))
    }

    fn finish(self) -> Result<(), FormatError> {
        if self.pos != self.buf.len() {
            return Err(FormatError::LengthMismatch { expected: self.pos, actual: self.buf.len() });
        }
        Ok(())
    }
}

/// Encode the hashed body of a transaction.
pub fn encode_tx_body(tx: &Transaction) -> Result<Vec<u8>, FormatError> {
    let input_count =
        u8::try_from(tx.inputs.len()).map_err(|_| FormatError::TooManyInputs(tx.inputs.len()))?;
    let output_count =
        u8::try_from(tx.outputs.len()).map_err(|_| FormatError::TooManyOutputs(tx.outputs.len()))?;
    let message_len =
        u32::try_from(tx.message.len()).map_err(|_| FormatError::MessageTooLarge(tx.message.len()))?;

    let mut out = Vec::with_capacity(
        TX_HEADER_LEN
            + tx.inputs.len() * TX_INPUT_LEN
            + tx.outputs.len() * TX_OUTPUT_LEN
            + tx.message.len(),
    );
    out.extend_from_slice(&tx.version.to_le_bytes());
    out.extend_from_slice(&tx.tx_type.to_u32().to_le_bytes());
    out.extend_from_slice(&tx.time.to_le_bytes());
    out.extend_from_slice(&tx.deadline.to_le_bytes());
    out.extend_from_slice(&tx.gas_price.to_le_bytes());
    out.extend_from_slice(&tx.gas_amount.to_le_bytes());
    out.push(tx.message_type.to_u8());
    out.push(input_count);
    out.push(output_count);
    out.extend_from_slice(&message_len.to_le_bytes());
    for input in &tx.inputs {
        out.extend_from_slice(input.previous_hash.as_bytes());
        out.push(input.index);
    }
    for output in &tx.outputs {
        out.extend_from_slice(output.address.as_bytes());
        out.extend_from_slice(&output.coin_id.to_le_bytes());
        out.extend_from_slice(&output.amount.to_le_bytes());
    }
    out.extend_from_slice(&tx.message);
    Ok(out)
}

/// Decode a transaction body. The buffer must be consumed exactly.
///
/// The result carries no signatures and no height.
pub fn decode_tx_body(bytes: &[u8]) -> Result<Transaction, FormatError> {
    let mut r = Reader::new(bytes);
    let version = r.u32_le()?;
    let tx_type = TxType::from_u32(r.u32_le()?)?;
    let time = r.u32_le()?;
    let deadline = r.u32_le()?;
    let gas_price = r.u64_le()?;
    let gas_amount = r.i64_le()?;
    let message_type = MessageType::from_u8(r.u8()?)?;
    let input_count = r.u8()? as usize;
    let output_count = r.u8()? as usize;
    let message_len = r.u32_le()? as usize;

    let mut inputs = Vec::with_capacity(input_count);
    for _ in 0..input_count {
        inputs.push(TxInput { previous_hash: r.hash()?, index: r.u8()? });
    }
    let mut outputs = Vec::with_capacity(output_count);
    for _ in 0..output_count {
        let address = Address::from_bytes(r.take(ADDRESS_LEN)?)?;
        let coin_id = r.u32_le()?;
        let amount = r.u64_le()?;
        outputs.push(TxOutput { address, coin_id, amount });
    }
    let message = r.take(message_len)?.to_vec();
    r.finish()?;

    Ok(Transaction {
        version,
        tx_type,
        time,
        deadline,
        gas_price,
        gas_amount,
        message_type,
        message,
        inputs,
        outputs,
        signatures: Vec::new(),
        height: None,
    })
}

pub fn encode_signatures(signatures: &[SignaturePair]) -> Vec<u8> {
    let mut out = Vec::with_capacity(signatures.len() * SIGNATURE_PAIR_LEN);
    for pair in signatures {
        out.extend_from_slice(&pair.public_key);
        out.extend_from_slice(&pair.signature);
    }
    out
}

pub fn decode_signatures(bytes: &[u8]) -> Result<Vec<SignaturePair>, FormatError> {
    if bytes.len() % SIGNATURE_PAIR_LEN != 0 {
        return Err(FormatError::SignatureBlob(bytes.len()));
    }
    let mut r = Reader::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() / SIGNATURE_PAIR_LEN);
    while r.pos < bytes.len() {
        out.push(SignaturePair { public_key: r.array()?, signature: r.array()? });
    }
    Ok(out)
}

/// Persisted transaction: `height, time, body_len, sig_len` (big-endian),
/// then the body and the signature blob.
pub fn encode_tx_record(tx: &Transaction) -> Result<Vec<u8>, FormatError> {
    let height = match tx.height {
        Some(height) => height,
        None => return Err(FormatError::MissingHeight(tx.txid()?.to_string())),
    };
    let body = encode_tx_body(tx)?;
    let signatures = encode_signatures(&tx.signatures);
    let mut out = Vec::with_capacity(TX_RECORD_HEADER_LEN + body.len() + signatures.len());
    out.extend_from_slice(&height.to_be_bytes());
    out.extend_from_slice(&tx.time.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&(signatures.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&signatures);
    Ok(out)
}

pub fn decode_tx_record(bytes: &[u8]) -> Result<Transaction, FormatError> {
    let mut r = Reader::new(bytes);
    let height = r.u32_be()?;
    let _time = r.u32_be()?;
    let body_len = r.u32_be()? as usize;
    let sig_len = r.u32_be()? as usize;
    let mut tx = decode_tx_body(r.take(body_len)?)?;
    tx.signatures = decode_signatures(r.take(sig_len)?)?;
    r.finish()?;
    tx.height = Some(height);
    Ok(tx)
}

/// Persisted form of a block: header fields plus the ordered txids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRecord {
    pub height: u32,
    pub work_hash: Hash256,
    pub header: BlockHeader,
    pub consensus: Consensus,
    pub txids: Vec<Hash256>,
}

impl BlockRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_RECORD_HEADER_LEN + self.txids.len() * 32);
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(&self.header.time.to_be_bytes());
        out.extend_from_slice(self.work_hash.as_bytes());
        out.extend_from_slice(&self.header.to_bytes());
        out.push(self.consensus.to_u8());
        out.extend_from_slice(&((self.txids.len() * 32) as u32).to_be_bytes());
        for txid in &self.txids {
            out.extend_from_slice(txid.as_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut r = Reader::new(bytes);
        let height = r.u32_be()?;
        let _time = r.u32_be()?;
        let work_hash = r.hash()?;
        let header = BlockHeader::from_bytes(r.take(BlockHeader::SIZE)?)?;
        let consensus = Consensus::from_u8(r.u8()?)?;
        let txids_len = r.u32_be()? as usize;
        if txids_len % 32 != 0 {
            return Err(FormatError::LengthMismatch { expected: txids_len / 32 * 32, actual: txids_len });
        }
        let txids = (0..txids_len / 32).map(|_| r.hash()).collect::<Result<Vec<_>, _>>()?;
        r.finish()?;
        Ok(Self { height, work_hash, header, consensus, txids })
    }

    /// Position of `txid` inside the block.
    pub fn position_of(&self, txid: &Hash256) -> Option<usize> {
        self.txids.iter().position(|h| h == txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 2,
            tx_type: TxType::Transfer,
            time: 1_000,
            deadline: 11_800,
            gas_price: 100,
            gas_amount: -5,
            message_type: MessageType::Plain,
            message: b"hello".to_vec(),
            inputs: vec![TxInput { previous_hash: Hash256([7; 32]), index: 1 }],
            outputs: vec![TxOutput {
                address: "N".repeat(40).parse().unwrap(),
                coin_id: 0,
                amount: 5_000,
            }],
            signatures: vec![SignaturePair { public_key: [1; 32], signature: [2; 64] }],
            height: None,
        }
    }

    #[test]
    fn body_length_matches_layout() {
        let body = encode_tx_body(&sample_tx()).unwrap();
        assert_eq!(body.len(), TX_HEADER_LEN + TX_INPUT_LEN + TX_OUTPUT_LEN + 5);
        assert_eq!(&body[0..4], &2u32.to_le_bytes());
        assert_eq!(&body[4..8], &3u32.to_le_bytes());
    }

    #[test]
    fn body_decodes_without_signatures() {
        let tx = sample_tx();
        let decoded = decode_tx_body(&encode_tx_body(&tx).unwrap()).unwrap();
        assert!(decoded.signatures.is_empty());
        assert_eq!(decoded.txid().unwrap(), tx.txid().unwrap());
    }

    #[test]
    fn trailing_byte_is_rejected() {
        let mut body = encode_tx_body(&sample_tx()).unwrap();
        body.push(0);
        assert!(matches!(decode_tx_body(&body), Err(FormatError::LengthMismatch { .. })));
    }

    #[test]
    fn missing_byte_is_rejected() {
        let body = encode_tx_body(&sample_tx()).unwrap();
        assert!(matches!(
            decode_tx_body(&body[..body.len() - 1]),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut body = encode_tx_body(&sample_tx()).unwrap();
        body[4..8].copy_from_slice(&42u32.to_le_bytes());
        assert_eq!(decode_tx_body(&body), Err(FormatError::UnknownTxType(42)));
    }

    #[test]
    fn too_many_inputs_fails_to_encode() {
        let mut tx = sample_tx();
        tx.inputs = vec![TxInput { previous_hash: Hash256::ZERO, index: 0 }; 256];
        assert_eq!(encode_tx_body(&tx), Err(FormatError::TooManyInputs(256)));
    }

    #[test]
    fn signatures_do_not_change_txid() {
        let mut tx = sample_tx();
        let before = tx.txid().unwrap();
        tx.signatures.clear();
        tx.height = Some(9);
        assert_eq!(tx.txid().unwrap(), before);
    }

    #[test]
    fn tx_record_requires_height() {
        assert!(matches!(encode_tx_record(&sample_tx()), Err(FormatError::MissingHeight(_))));
    }

    #[test]
    fn tx_record_keeps_height_and_signatures() {
        let mut tx = sample_tx();
        tx.height = Some(12);
        let record = encode_tx_record(&tx).unwrap();
        assert_eq!(&record[0..4], &12u32.to_be_bytes());
        assert_eq!(decode_tx_record(&record).unwrap(), tx);
    }

    #[test]
    fn signature_blob_must_be_whole_pairs() {
        assert_eq!(decode_signatures(&[0u8; 95]), Err(FormatError::SignatureBlob(95)));
        assert!(decode_signatures(&[]).unwrap().is_empty());
    }

    #[test]
    fn block_record_layout() {
        let record = BlockRecord {
            height: 5,
            work_hash: Hash256([9; 32]),
            header: BlockHeader {
                version: 1,
                previous_hash: Hash256([1; 32]),
                merkle_root: Hash256([2; 32]),
                time: 300,
                bits: 0x1f0f_ffff,
                nonce: 4,
            },
            consensus: Consensus::X11,
            txids: vec![Hash256([5; 32]), Hash256([6; 32])],
        };
        let bytes = record.encode();
        assert_eq!(bytes.len(), BLOCK_RECORD_HEADER_LEN + 64);
        assert_eq!(&bytes[4..8], &300u32.to_be_bytes());
        let decoded = BlockRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.position_of(&Hash256([6; 32])), Some(1));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            #[test]
            fn signature_blob_decodes_back(keys in proptest::collection::vec(any::<[u8; 32]>(), 0..6)) {
                let pairs: Vec<SignaturePair> =
                    keys.iter().map(|k| SignaturePair { public_key: *k, signature: [k[0]; 64] }).collect();
                prop_assert_eq!(decode_signatures(&encode_signatures(&pairs)).unwrap(), pairs);
            }

            #[test]
            fn truncated_block_record_is_rejected(count in 0usize..5, cut in 1usize..64) {
                let record = BlockRecord {
                    height: 1,
                    work_hash: Hash256::ZERO,
                    header: BlockHeader {
                        version: 1,
                        previous_hash: Hash256([1; 32]),
                        merkle_root: Hash256([2; 32]),
                        time: 0,
                        bits: 0x1f0f_ffff,
                        nonce: 0,
                    },
                    consensus: Consensus::Stake,
                    txids: vec![Hash256([3; 32]); count],
                };
                let bytes = record.encode();
                let cut = cut.min(bytes.len());
                prop_assert!(BlockRecord::decode(&bytes[..bytes.len() - cut]).is_err());
                prop_assert_eq!(BlockRecord::decode(&bytes).unwrap(), record);
            }
        }
    }
}
