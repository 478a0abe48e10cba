use crate::cache::CacheStore;
use crate::codec::Codec;
use crate::error::{DecodeError, EngineError, FetchError, ProtocolError};
use crate::protocol::ForwardMsg;
use futures_util::FutureExt;
use futures_util::future::{LocalBoxFuture, Shared};
use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::info;

/// Where cache misses are fetched from.
#[async_trait::async_trait(?Send)]
pub trait Endpoint {
    async fn fetch_cached_message(&self, hash: &str) -> Result<Vec<u8>, FetchError>;
}

type PendingFetch = Shared<LocalBoxFuture<'static, Result<Rc<[u8]>, FetchError>>>;

/// Resolves hash references against the message cache, storing cacheable
/// messages as they go by.
///
/// `resolve` takes `&self` so that several resolutions can be in flight on
/// one thread. Misses for the same hash share a single endpoint request.
pub struct MessageDereferencer {
    cache: RefCell<CacheStore>,
    pending: RefCell<HashMap<String, PendingFetch>>,
    endpoint: Rc<dyn Endpoint>,
    codec: Rc<dyn Codec>,
}

impl MessageDereferencer {
    pub fn new(endpoint: Rc<dyn Endpoint>, codec: Rc<dyn Codec>) -> Self {
        Self {
            cache: RefCell::new(CacheStore::new()),
            pending: RefCell::new(HashMap::new()),
            endpoint,
            codec,
        }
    }

    pub fn cache(&self) -> Ref<'_, CacheStore> {
        self.cache.borrow()
    }

    pub fn pending_fetches(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn advance_run_count_and_evict(&self, max_age: u32) -> usize {
        self.cache.borrow_mut().advance_run_count_and_evict(max_age)
    }

    /// - cacheable message: stored (once) and returned unmodified;
    /// - reference: replaced by the referenced message, fetched from the
    ///   endpoint on a miss, carrying the reference's own metadata;
    /// - anything else: returned unmodified.
    pub async fn resolve(&self, msg: ForwardMsg, encoded: &[u8]) -> Result<ForwardMsg, EngineError> {
        self.maybe_cache(&msg, encoded);

        let Some(ref_hash) = msg.ref_hash() else {
            return Ok(msg);
        };

        let Some(metadata) = msg.metadata.clone() else {
            return Err(ProtocolError::MissingMetadata {
                ref_hash: ref_hash.to_string(),
            }
            .into());
        };

        let mut resolved = match self.cached_message(ref_hash)? {
            Some(cached) => {
                info!(hash = %ref_hash, "cached forward message hit");
                cached
            }
            None => {
                info!(hash = %ref_hash, "cached forward message miss");
                let fetched = self.fetch(ref_hash).await?;
                let decoded = self.decode_for(ref_hash, &fetched)?;

                if decoded.is_reference() {
                    return Err(ProtocolError::NestedReference {
                        hash: ref_hash.to_string(),
                    }
                    .into());
                }

                self.maybe_cache(&decoded, &fetched);
                decoded
            }
        };

        resolved.metadata = Some(metadata);
        Ok(resolved)
    }

    fn maybe_cache(&self, msg: &ForwardMsg, encoded: &[u8]) {
        if !msg.is_cacheable() {
            return;
        }

        let mut cache = self.cache.borrow_mut();

        // get() rather than contains(): a repeat sighting is an access.
        if cache.get(&msg.hash).is_some() {
            return;
        }

        info!(hash = %msg.hash, "caching forward message");
        cache.put(msg.hash.clone(), encoded.to_vec());
    }

    /// Always a fresh decode, so callers may mutate what they get back.
    fn cached_message(&self, hash: &str) -> Result<Option<ForwardMsg>, DecodeError> {
        let mut cache = self.cache.borrow_mut();
        match cache.get(hash) {
            Some(encoded) => self.decode_for(hash, encoded).map(Some),
            None => Ok(None),
        }
    }

    fn decode_for(&self, hash: &str, encoded: &[u8]) -> Result<ForwardMsg, DecodeError> {
        self.codec.decode(encoded).map_err(|err| DecodeError::Cached {
            hash: hash.to_string(),
            reason: err.to_string(),
        })
    }

    async fn fetch(&self, hash: &str) -> Result<Rc<[u8]>, FetchError> {
        let request = self
            .pending
            .borrow_mut()
            .entry(hash.to_string())
            .or_insert_with(|| {
                let endpoint = Rc::clone(&self.endpoint);
                let hash = hash.to_string();
                async move {
                    endpoint
                        .fetch_cached_message(&hash)
                        .await
                        .map(Rc::<[u8]>::from)
                }
                .boxed_local()
                .shared()
            })
            .clone();

        let result = request.clone().await;

        let mut pending = self.pending.borrow_mut();
        if pending
            .get(hash)
            .is_some_and(|current| current.ptr_eq(&request))
        {
            pending.remove(hash);
        }

        result
    }
}
