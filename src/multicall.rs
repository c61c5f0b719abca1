use crate::address::normalize;
use crate::errors::CoreError;
use crate::metrics;
use crate::settings;
use crate::transport::{revert_reason, MethodCall, Transport};
use async_trait::async_trait;
use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use indexmap::IndexMap;
use log::{debug, warn};
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Largest chunk most providers accept in one `eth_call`.
const MAX_BATCH_SIZE: usize = 200;

/// `aggregate3(Call3[] calls) returns (Result[] returnData)`
/// with `Call3 = (address target, bool allowFailure, bytes callData)` and
/// `Result = (bool success, bytes returnData)`.
#[allow(deprecated)]
static AGGREGATE3: Lazy<Function> = Lazy::new(|| Function {
    name: "aggregate3".to_string(),
    inputs: vec![Param {
        name: "calls".to_string(),
        kind: ParamType::Array(Box::new(ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::Bool,
            ParamType::Bytes,
        ]))),
        internal_type: None,
    }],
    outputs: vec![Param {
        name: "returnData".to_string(),
        kind: aggregate3_output(),
        internal_type: None,
    }],
    constant: None,
    state_mutability: StateMutability::Payable,
});

fn aggregate3_output() -> ParamType {
    ParamType::Array(Box::new(ParamType::Tuple(vec![
        ParamType::Bool,
        ParamType::Bytes,
    ])))
}

/// [`Transport`] over an ethers middleware, aggregating through Multicall3.
///
/// Identical calls inside one `call_many` are coalesced before submission and the answers
/// fanned back out in request order. Requests larger than the batch size are split into
/// several aggregate calls.
#[derive(Clone)]
pub struct EthersTransport<M: Middleware> {
    provider: Arc<M>,
    multicall_address: Address,
    batch_size: usize,
}

impl<M: Middleware + 'static> EthersTransport<M> {
    pub fn new(provider: Arc<M>, multicall_address: Address, batch_size: usize) -> Self {
        if batch_size > MAX_BATCH_SIZE {
            warn!(
                "Batch size {} exceeds recommended maximum ({}), capping",
                batch_size, MAX_BATCH_SIZE
            );
        }
        Self {
            provider,
            multicall_address,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
        }
    }

    pub fn from_settings(provider: Arc<M>, rpc: &settings::Rpc) -> Result<Self, CoreError> {
        let multicall_address = normalize(rpc.multicall_address.as_str())?.as_address();
        Ok(Self::new(provider, multicall_address, rpc.multicall_batch_size))
    }

    pub fn provider(&self) -> &Arc<M> {
        &self.provider
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn eth_call(
        &self,
        to: Address,
        data: Bytes,
        block: Option<u64>,
    ) -> Result<Bytes, M::Error> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.provider.call(&tx, block.map(BlockId::from)).await
    }

    async fn execute_multicall3(
        &self,
        calls: &[(Address, Bytes)],
        block: Option<u64>,
    ) -> Result<Vec<(bool, Bytes)>, CoreError> {
        let call_tokens = calls
            .iter()
            .map(|(target, data)| {
                Token::Tuple(vec![
                    Token::Address(*target),
                    Token::Bool(true),
                    Token::Bytes(data.to_vec()),
                ])
            })
            .collect();

        let calldata = AGGREGATE3
            .encode_input(&[Token::Array(call_tokens)])
            .map_err(|e| CoreError::InvalidMethod(format!("aggregate3: {}", e)))?;

        let response = self
            .eth_call(self.multicall_address, calldata.into(), block)
            .await
            .map_err(|e| CoreError::TransportFault(format!("aggregate3 failed: {}", e)))?;

        let decoded = ethers::abi::decode(&[aggregate3_output()], &response).map_err(|e| {
            CoreError::TransportFault(format!("invalid aggregate3 response: {}", e))
        })?;

        let results = decoded
            .into_iter()
            .next()
            .and_then(|t| t.into_array())
            .ok_or_else(|| CoreError::TransportFault("invalid aggregate3 response".to_string()))?;

        let mut out = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Token::Tuple(fields) => match fields.as_slice() {
                    [Token::Bool(success), Token::Bytes(data)] => {
                        out.push((*success, Bytes::from(data.clone())))
                    }
                    _ => {
                        return Err(CoreError::TransportFault(
                            "malformed aggregate3 result entry".to_string(),
                        ))
                    }
                },
                _ => {
                    return Err(CoreError::TransportFault(
                        "malformed aggregate3 result entry".to_string(),
                    ))
                }
            }
        }

        if out.len() != calls.len() {
            return Err(CoreError::TransportFault(format!(
                "aggregate3 returned {} results for {} calls",
                out.len(),
                calls.len()
            )));
        }
        Ok(out)
    }
}

fn classify_call_error<E: MiddlewareError>(method: &MethodCall, err: E) -> CoreError {
    if let Some(response) = err.as_error_response() {
        // code 3 carries revert data; older nodes only say so in the message
        if response.code == 3 || response.message.to_ascii_lowercase().contains("revert") {
            return method.reverted(response.message.clone());
        }
    }
    CoreError::TransportFault(err.to_string())
}

#[async_trait]
impl<M: Middleware + 'static> Transport for EthersTransport<M> {
    async fn call(
        &self,
        target: Address,
        method: &MethodCall,
        block: Option<u64>,
    ) -> Result<Bytes, CoreError> {
        self.eth_call(target, method.calldata(), block)
            .await
            .map_err(|e| classify_call_error(method, e))
    }

    async fn call_many(
        &self,
        calls: &[(Address, MethodCall)],
        block: Option<u64>,
    ) -> Result<Vec<Result<Bytes, CoreError>>, CoreError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let mut unique_calls = IndexMap::new();
        let mut original_indices = Vec::with_capacity(calls.len());
        for (target, method) in calls {
            let (index, _) = unique_calls.insert_full((*target, method.calldata()), ());
            original_indices.push(index);
        }
        let unique_calls: Vec<(Address, Bytes)> = unique_calls.into_keys().collect();
        debug!(
            "Multicall coalesced {} calls into {}",
            calls.len(),
            unique_calls.len()
        );

        let mut unique_results = Vec::with_capacity(unique_calls.len());
        for chunk in unique_calls.chunks(self.batch_size) {
            metrics::record_multicall_batch_size(chunk.len() as f64);
            unique_results.extend(self.execute_multicall3(chunk, block).await?);
        }

        Ok(calls
            .iter()
            .zip(original_indices)
            .map(|((_, method), index)| {
                let (success, data) = &unique_results[index];
                if *success {
                    Ok(data.clone())
                } else {
                    Err(method.reverted(revert_reason(data)))
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate3_selector() {
        // aggregate3((address,bool,bytes)[])
        assert_eq!(AGGREGATE3.short_signature(), [0x82, 0xad, 0x56, 0xcb]);
    }

    #[test]
    fn test_batch_size_is_capped() {
        let provider = Arc::new(Provider::<Http>::try_from("http://localhost:8545").unwrap());
        let transport = EthersTransport::new(provider.clone(), Address::zero(), 1000);
        assert_eq!(transport.batch_size(), MAX_BATCH_SIZE);
        let transport = EthersTransport::new(provider, Address::zero(), 0);
        assert_eq!(transport.batch_size(), 1);
    }

    #[test]
    fn test_from_settings_rejects_bad_multicall_address() {
        let provider = Arc::new(Provider::<Http>::try_from("http://localhost:8545").unwrap());
        let rpc = settings::Rpc {
            multicall_address: "0x1234".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            EthersTransport::from_settings(provider, &rpc),
            Err(CoreError::InvalidAddressFormat(_))
        ));
    }
}
