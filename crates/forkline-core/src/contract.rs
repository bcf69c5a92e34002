//! Contract, coin and validator message payloads, and the executor seam.
//!
//! Transactions of type `MintCoin`, `ValidatorEdit`, `ContractStart` and
//! `ContractConclude` carry a bincode payload in their message bytes. The
//! ledger records their side effects when the transaction is flushed; the
//! contract sandbox itself lives behind [`ContractExecutor`].

use crate::constants::ADDRESS_LEN;
use crate::error::{ForklineError, FormatError};
use crate::types::{Address, Hash256, MessageType, Transaction, TxType};

macro_rules! bincode_payload {
    ($($ty:ty),* $(,)?) => {$(
        impl $ty {
            pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
                bincode::encode_to_vec(self, bincode::config::standard())
                    .map_err(|e| FormatError::Payload(e.to_string()))
            }

            pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
                let (value, read) = bincode::decode_from_slice(bytes, bincode::config::standard())
                    .map_err(|e| FormatError::Payload(e.to_string()))?;
                if read != bytes.len() {
                    return Err(FormatError::LengthMismatch { expected: read, actual: bytes.len() });
                }
                Ok(value)
            }
        }
    )*};
}

/// Registers a new coin id or updates its parameters.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct MintCoinMessage {
    pub coin_id: u32,
    pub params: Vec<u8>,
    pub setting: Vec<u8>,
}

/// Changes the validator set of a contract.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ValidatorEditMessage {
    pub validator: Address,
    pub new_address: Option<Address>,
    pub flag: i8,
    pub sig_diff: i8,
}

/// Requests a contract method call.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ContractStartMessage {
    pub contract: Address,
    pub method: String,
    pub redeem: Address,
    pub args: Vec<u8>,
}

/// Commits the result of a started call.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ContractConcludeMessage {
    pub contract: Address,
    pub start_hash: Hash256,
    pub storage_diff: Vec<u8>,
}

/// Method, arguments and storage changes of one concluded call.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ContractPayload {
    pub method: String,
    pub args: Vec<u8>,
    pub storage_diff: Vec<u8>,
}

bincode_payload!(
    MintCoinMessage,
    ValidatorEditMessage,
    ContractStartMessage,
    ContractConcludeMessage,
    ContractPayload,
);

/// Persisted contract log entry: `start_hash, conclude_hash, payload`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractRecord {
    pub start_hash: Hash256,
    pub conclude_hash: Hash256,
    pub payload: ContractPayload,
}

impl ContractRecord {
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let payload = self.payload.encode()?;
        let mut out = Vec::with_capacity(64 + payload.len());
        out.extend_from_slice(self.start_hash.as_bytes());
        out.extend_from_slice(self.conclude_hash.as_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < 64 {
            return Err(FormatError::Truncated { needed: 64, available: bytes.len() });
        }
        Ok(Self {
            start_hash: Hash256::from_slice(&bytes[..32])?,
            conclude_hash: Hash256::from_slice(&bytes[32..64])?,
            payload: ContractPayload::decode(&bytes[64..])?,
        })
    }
}

/// Persisted validator log entry: `new_address, flag, txid, sig_diff`.
///
/// A missing new address is stored as 40 zero bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatorRecord {
    pub new_address: Option<Address>,
    pub flag: i8,
    pub txid: Hash256,
    pub sig_diff: i8,
}

impl ValidatorRecord {
    pub const SIZE: usize = ADDRESS_LEN + 1 + 32 + 1;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        match &self.new_address {
            Some(address) => out.extend_from_slice(address.as_bytes()),
            None => out.extend_from_slice(&[0u8; ADDRESS_LEN]),
        }
        out.push(self.flag as u8);
        out.extend_from_slice(self.txid.as_bytes());
        out.push(self.sig_diff as u8);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() != Self::SIZE {
            return Err(FormatError::LengthMismatch { expected: Self::SIZE, actual: bytes.len() });
        }
        let address = &bytes[..ADDRESS_LEN];
        let new_address = if address.iter().all(|b| *b == 0) {
            None
        } else {
            Some(Address::from_bytes(address)?)
        };
        Ok(Self {
            new_address,
            flag: bytes[ADDRESS_LEN] as i8,
            txid: Hash256::from_slice(&bytes[ADDRESS_LEN + 1..ADDRESS_LEN + 33])?,
            sig_diff: bytes[ADDRESS_LEN + 33] as i8,
        })
    }
}

/// Input to the contract sandbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub contract: Address,
    pub method: String,
    pub args: Vec<u8>,
    pub gas_budget: i64,
}

/// What the sandbox reports back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: Vec<u8>,
    pub storage_diff: Vec<u8>,
    pub gas_used: i64,
}

/// Deterministic contract execution, supplied by the embedding node.
pub trait ContractExecutor: Send + Sync {
    fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, ForklineError>;
}

fn start_message(start: &Transaction) -> Result<ContractStartMessage, FormatError> {
    if start.tx_type != TxType::ContractStart {
        return Err(FormatError::Payload(format!("{:?} is not a contract start", start.tx_type)));
    }
    ContractStartMessage::decode(&start.message)
}

/// Sandbox request for a `ContractStart` transaction.
pub fn request_for(start: &Transaction) -> Result<ExecutionRequest, FormatError> {
    let msg = start_message(start)?;
    Ok(ExecutionRequest {
        contract: msg.contract,
        method: msg.method,
        args: msg.args,
        gas_budget: start.gas_amount,
    })
}

/// Run `start` through `executor` and wrap the outcome as a
/// `ContractConclude` transaction.
///
/// Failed executions conclude with an empty storage diff.
pub fn conclude<E: ContractExecutor + ?Sized>(
    executor: &E,
    start: &Transaction,
    time: u32,
    deadline: u32,
) -> Result<Transaction, ForklineError> {
    let request = request_for(start)?;
    let outcome = executor.execute(&request)?;
    let message = ContractConcludeMessage {
        contract: request.contract,
        start_hash: start.txid()?,
        storage_diff: if outcome.success { outcome.storage_diff } else { Vec::new() },
    };
    Ok(Transaction {
        version: start.version,
        tx_type: TxType::ContractConclude,
        time,
        deadline,
        gas_price: start.gas_price,
        gas_amount: outcome.gas_used,
        message_type: MessageType::Bytes,
        message: message.encode()?,
        inputs: Vec::new(),
        outputs: Vec::new(),
        signatures: Vec::new(),
        height: None,
    })
}
