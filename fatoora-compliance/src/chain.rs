//! Invoice canonicalization and the per-organization hash chain.
//!
//! The canonical form of an invoice drops the XML declaration, processing
//! instructions, comments, the doctype and whitespace-only text, trims text
//! nodes, sorts attributes, expands empty elements and removes the subtrees
//! that are never hashed (`UBLExtensions`, the root-level `cac:Signature` and
//! the `QR` additional document reference). The previous invoice hash is
//! embedded in the `PIH` additional document reference before hashing.
use crate::certificate::InvoiceCategory;
use base64ct::{Base64, Encoding};
use parking_lot::{Mutex, RwLock};
use quick_xml::{
    Reader, Writer,
    escape::partial_escape,
    events::{BytesEnd, BytesStart, BytesText, Event},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

/// Base64 of 32 zero bytes: the previous hash of the first invoice in a chain.
pub const GENESIS_HASH: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

const PIH_ID: &str = "PIH";
const QR_ID: &str = "QR";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("invoice XML error: {0}")]
    Xml(String),

    #[error("chain head for {key} moved: expected {expected}, found {actual}")]
    Conflict {
        key: ChainKey,
        expected: String,
        actual: String,
    },

    #[error("chain broken at invoice {index}: expected PIH {expected}, found {found:?}")]
    Broken {
        index: usize,
        expected: String,
        found: Option<String>,
    },
}

impl From<quick_xml::Error> for ChainError {
    fn from(e: quick_xml::Error) -> Self {
        ChainError::Xml(e.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for ChainError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        ChainError::Xml(e.to_string())
    }
}

impl From<std::io::Error> for ChainError {
    fn from(e: std::io::Error) -> Self {
        ChainError::Xml(e.to_string())
    }
}

/// Identifies one chain: an organization's sequence for one invoice category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainKey {
    pub organization_id: String,
    pub category: InvoiceCategory,
}

impl ChainKey {
    pub fn new(organization_id: impl Into<String>, category: InvoiceCategory) -> Self {
        Self {
            organization_id: organization_id.into(),
            category,
        }
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.organization_id, self.category)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub previous_invoice_hash: String,
    /// Number of invoices accepted on this chain so far.
    pub counter: u64,
}

impl ChainState {
    pub fn genesis() -> Self {
        Self {
            previous_invoice_hash: GENESIS_HASH.to_string(),
            counter: 0,
        }
    }
}

impl Default for ChainState {
    fn default() -> Self {
        Self::genesis()
    }
}

/// Persistence for chain heads. Advancing is a compare-and-swap.
pub trait ChainStore: Send + Sync {
    /// Current head, or genesis for an unknown chain.
    fn head(&self, key: &ChainKey) -> ChainState;

    fn compare_and_advance(
        &self,
        key: &ChainKey,
        expected_previous: &str,
        new_hash: &str,
    ) -> Result<ChainState, ChainError>;
}

#[derive(Debug, Default)]
pub struct InMemoryChainStore {
    heads: RwLock<HashMap<ChainKey, ChainState>>,
}

impl InMemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChainStore for InMemoryChainStore {
    fn head(&self, key: &ChainKey) -> ChainState {
        self.heads.read().get(key).cloned().unwrap_or_default()
    }

    fn compare_and_advance(
        &self,
        key: &ChainKey,
        expected_previous: &str,
        new_hash: &str,
    ) -> Result<ChainState, ChainError> {
        let mut heads = self.heads.write();
        let state = heads.entry(key.clone()).or_default();
        if state.previous_invoice_hash != expected_previous {
            return Err(ChainError::Conflict {
                key: key.clone(),
                expected: expected_previous.to_string(),
                actual: state.previous_invoice_hash.clone(),
            });
        }
        state.previous_invoice_hash = new_hash.to_string();
        state.counter += 1;
        Ok(state.clone())
    }
}

/// Serializes work on each chain and advances heads through a [`ChainStore`].
pub struct InvoiceHashChain {
    store: Arc<dyn ChainStore>,
    locks: Mutex<HashMap<ChainKey, Arc<tokio::sync::Mutex<()>>>>,
}

/// Exclusive hold on one chain from reading its head until advancing it.
pub struct ChainLease<'a> {
    chain: &'a InvoiceHashChain,
    key: ChainKey,
    head: ChainState,
    _guard: OwnedMutexGuard<()>,
}

impl ChainLease<'_> {
    pub fn key(&self) -> &ChainKey {
        &self.key
    }

    pub fn head(&self) -> &ChainState {
        &self.head
    }

    /// Move the head to `new_hash`, releasing the lease.
    pub fn advance(self, new_hash: &str) -> Result<ChainState, ChainError> {
        let state = self.chain.store.compare_and_advance(
            &self.key,
            &self.head.previous_invoice_hash,
            new_hash,
        )?;
        debug!(chain = %self.key, counter = state.counter, "chain head advanced");
        Ok(state)
    }
}

impl InvoiceHashChain {
    pub fn new(store: Arc<dyn ChainStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn head(&self, key: &ChainKey) -> ChainState {
        self.store.head(key)
    }

    /// Wait for exclusive access to the chain and read its head.
    pub async fn lease(&self, key: ChainKey) -> ChainLease<'_> {
        let lock = self.locks.lock().entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        let head = self.store.head(&key);
        ChainLease {
            chain: self,
            key,
            head,
            _guard: guard,
        }
    }
}

impl fmt::Debug for InvoiceHashChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvoiceHashChain")
            .field("chains", &self.locks.lock().len())
            .finish_non_exhaustive()
    }
}

/// Canonical bytes plus the PIH value found in the source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalInvoice {
    pub bytes: Vec<u8>,
    pub embedded_pih: Option<String>,
}

/// Canonicalize with `previous_hash` embedded as the PIH.
pub fn canonicalize(xml: &str, previous_hash: &str) -> Result<CanonicalInvoice, ChainError> {
    Rewriter::canonical(Some(previous_hash)).run(xml)
}

/// Base64 SHA-256 of the canonical form with `previous_hash` embedded.
///
/// # Examples
/// ```rust
/// use fatoora_compliance::chain::{GENESIS_HASH, hash_invoice};
///
/// let a = hash_invoice("<Invoice><ID>1</ID></Invoice>", GENESIS_HASH)?;
/// let b = hash_invoice("<?xml version=\"1.0\"?>\n<Invoice>\n  <ID> 1 </ID>\n</Invoice>", GENESIS_HASH)?;
/// assert_eq!(a, b);
/// # Ok::<(), fatoora_compliance::chain::ChainError>(())
/// ```
pub fn hash_invoice(xml: &str, previous_hash: &str) -> Result<String, ChainError> {
    let canonical = canonicalize(xml, previous_hash)?;
    Ok(digest_base64(&canonical.bytes))
}

/// Hash of a document as it stands, using its own embedded PIH.
pub fn hash_as_submitted(xml: &str) -> Result<(String, Option<String>), ChainError> {
    let canonical = Rewriter::canonical(None).run(xml)?;
    Ok((digest_base64(&canonical.bytes), canonical.embedded_pih))
}

/// Write `previous_hash` and the QR payload into the submitted document.
///
/// The output hashes identically to `hash_invoice(xml, previous_hash)`.
pub fn embed_references(xml: &str, previous_hash: &str, qr: &str) -> Result<String, ChainError> {
    let out = Rewriter::embedding(previous_hash, qr).run(xml)?;
    String::from_utf8(out.bytes).map_err(|e| ChainError::Xml(e.to_string()))
}

/// Check that every document embeds the hash of its predecessor.
///
/// Returns the hash of each document in order; the last one is the head the
/// chain should be at.
pub fn verify_chain<S: AsRef<str>>(documents: &[S]) -> Result<Vec<String>, ChainError> {
    let mut hashes = Vec::with_capacity(documents.len());
    let mut expected = GENESIS_HASH.to_string();
    for (index, doc) in documents.iter().enumerate() {
        let (hash, found) = hash_as_submitted(doc.as_ref())?;
        if found.as_deref() != Some(expected.as_str()) {
            warn!(index, "invoice chain broken");
            return Err(ChainError::Broken {
                index,
                expected,
                found,
            });
        }
        expected = hash.clone();
        hashes.push(hash);
    }
    Ok(hashes)
}

pub fn digest_base64(bytes: &[u8]) -> String {
    Base64::encode_string(&Sha256::digest(bytes))
}

struct Rewriter<'p> {
    canonical: bool,
    pih: Option<&'p str>,
    qr: Option<&'p str>,
}

#[derive(Default)]
struct RewriteState {
    depth: usize,
    skip_from: Option<usize>,
    reference: Option<Vec<Event<'static>>>,
    reference_depth: usize,
    pih_seen: bool,
    qr_seen: bool,
    found_pih: Option<String>,
}

fn is_local(name: &[u8], local: &str) -> bool {
    let local_part = match name.iter().rposition(|b| *b == b':') {
        Some(i) => &name[i + 1..],
        None => name,
    };
    local_part == local.as_bytes()
}

// Elements that follow the additional document references in a UBL invoice.
fn is_reference_boundary(name: &[u8]) -> bool {
    is_local(name, "Signature") || is_local(name, "AccountingSupplierParty")
}

fn reference_events(id: &str, body_element: &str, body: &str, attr: (&str, &str)) -> Vec<Event<'static>> {
    let mut body_start = BytesStart::new(format!("cbc:{body_element}"));
    body_start.push_attribute(attr);
    vec![
        Event::Start(BytesStart::new("cac:AdditionalDocumentReference")),
        Event::Start(BytesStart::new("cbc:ID")),
        Event::Text(BytesText::new(id).into_owned()),
        Event::End(BytesEnd::new("cbc:ID")),
        Event::Start(BytesStart::new("cac:Attachment")),
        Event::Start(body_start),
        Event::Text(BytesText::new(body).into_owned()),
        Event::End(BytesEnd::new(format!("cbc:{body_element}"))),
        Event::End(BytesEnd::new("cac:Attachment")),
        Event::End(BytesEnd::new("cac:AdditionalDocumentReference")),
    ]
}

fn pih_reference(pih: &str) -> Vec<Event<'static>> {
    reference_events(PIH_ID, "EmbeddedDocumentBinaryObject", pih, ("mimeCode", "text/plain"))
}

fn qr_reference(qr: &str) -> Vec<Event<'static>> {
    reference_events(QR_ID, "EmbeddedDocumentBinaryObject", qr, ("mimeCode", "text/plain"))
}

fn text_of(event: &Event<'_>) -> Result<Option<String>, ChainError> {
    match event {
        Event::Text(t) => Ok(Some(t.unescape()?.trim().to_string())),
        Event::CData(c) => Ok(Some(
            std::str::from_utf8(c.as_ref())
                .map_err(|e| ChainError::Xml(e.to_string()))?
                .trim()
                .to_string(),
        )),
        _ => Ok(None),
    }
}

/// `cbc:ID` value of a buffered additional document reference.
fn reference_id(events: &[Event<'static>]) -> Result<Option<String>, ChainError> {
    let mut in_id = false;
    for event in events {
        match event {
            Event::Start(e) if is_local(e.name().as_ref(), "ID") => in_id = true,
            Event::End(_) if in_id => return Ok(Some(String::new())),
            other if in_id => {
                if let Some(text) = text_of(other)? {
                    return Ok(Some(text));
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

/// Text of the `EmbeddedDocumentBinaryObject` in a buffered reference.
fn reference_body(events: &[Event<'static>]) -> Result<Option<String>, ChainError> {
    let mut in_body = false;
    for event in events {
        match event {
            Event::Start(e) if is_local(e.name().as_ref(), "EmbeddedDocumentBinaryObject") => {
                in_body = true
            }
            Event::End(_) if in_body => return Ok(Some(String::new())),
            other if in_body => {
                if let Some(text) = text_of(other)? {
                    return Ok(Some(text));
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

/// Replace the body text of a buffered reference, keeping its markup.
fn with_body(events: Vec<Event<'static>>, body: &str) -> Vec<Event<'static>> {
    let mut out = Vec::with_capacity(events.len() + 1);
    let mut in_body = false;
    for event in events {
        match event {
            Event::Start(e) if is_local(e.name().as_ref(), "EmbeddedDocumentBinaryObject") => {
                in_body = true;
                out.push(Event::Start(e));
            }
            Event::Empty(e) if is_local(e.name().as_ref(), "EmbeddedDocumentBinaryObject") => {
                let end = BytesEnd::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                out.push(Event::Start(e));
                out.push(Event::Text(BytesText::new(body).into_owned()));
                out.push(Event::End(end));
            }
            Event::Text(_) | Event::CData(_) if in_body => {}
            Event::End(e) if in_body => {
                in_body = false;
                out.push(Event::Text(BytesText::new(body).into_owned()));
                out.push(Event::End(e));
            }
            other => out.push(other),
        }
    }
    out
}

impl<'p> Rewriter<'p> {
    fn canonical(pih: Option<&'p str>) -> Self {
        Self {
            canonical: true,
            pih,
            qr: None,
        }
    }

    fn embedding(pih: &'p str, qr: &'p str) -> Self {
        Self {
            canonical: false,
            pih: Some(pih),
            qr: Some(qr),
        }
    }

    fn run(&self, xml: &str) -> Result<CanonicalInvoice, ChainError> {
        let mut reader = Reader::from_str(xml);
        if self.canonical {
            reader.config_mut().trim_text(true);
            reader.config_mut().expand_empty_elements = true;
        }
        let mut writer = Writer::new(Vec::new());
        let mut state = RewriteState::default();
        let mut saw_root = false;

        loop {
            let event = reader.read_event()?;
            if let Event::Eof = event {
                break;
            }
            if let Event::Start(_) | Event::Empty(_) = event {
                saw_root = true;
            }
            self.handle(event.into_owned(), &mut state, &mut writer)?;
        }

        if !saw_root {
            return Err(ChainError::Xml("document has no root element".into()));
        }
        if state.depth != 0 {
            return Err(ChainError::Xml("unexpected end of document".into()));
        }
        Ok(CanonicalInvoice {
            bytes: writer.into_inner(),
            embedded_pih: state.found_pih,
        })
    }

    fn handle(
        &self,
        event: Event<'static>,
        state: &mut RewriteState,
        writer: &mut Writer<Vec<u8>>,
    ) -> Result<(), ChainError> {
        if let Some(buffer) = state.reference.as_mut() {
            match &event {
                Event::Start(_) => state.depth += 1,
                Event::End(_) => state.depth -= 1,
                _ => {}
            }
            buffer.push(event);
            if state.depth == state.reference_depth {
                let events = state.reference.take().unwrap_or_default();
                self.finish_reference(events, state, writer)?;
            }
            return Ok(());
        }

        if let Some(from) = state.skip_from {
            match &event {
                Event::Start(_) => state.depth += 1,
                Event::End(_) => {
                    state.depth -= 1;
                    if state.depth == from {
                        state.skip_from = None;
                    }
                }
                _ => {}
            }
            return Ok(());
        }

        match event {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                if state.depth == 1 && is_reference_boundary(&name) {
                    self.insert_missing(state, writer)?;
                }
                if self.is_excluded(&name, state.depth) {
                    state.skip_from = Some(state.depth);
                    state.depth += 1;
                    return Ok(());
                }
                if state.depth == 1 && is_local(&name, "AdditionalDocumentReference") {
                    state.reference_depth = state.depth;
                    state.depth += 1;
                    state.reference = Some(vec![Event::Start(e)]);
                    return Ok(());
                }
                state.depth += 1;
                self.write(Event::Start(e), writer)
            }
            Event::Empty(e) => {
                let name = e.name().as_ref().to_vec();
                if state.depth == 1 && is_reference_boundary(&name) {
                    self.insert_missing(state, writer)?;
                }
                if self.is_excluded(&name, state.depth) {
                    return Ok(());
                }
                self.write(Event::Empty(e), writer)
            }
            Event::End(e) => {
                if state.depth == 1 {
                    self.insert_missing(state, writer)?;
                }
                state.depth = state.depth.saturating_sub(1);
                self.write(Event::End(e), writer)
            }
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_)
                if self.canonical =>
            {
                Ok(())
            }
            other => self.write(other, writer),
        }
    }

    fn is_excluded(&self, name: &[u8], depth: usize) -> bool {
        self.canonical
            && (is_local(name, "UBLExtensions") || (depth == 1 && is_local(name, "Signature")))
    }

    fn finish_reference(
        &self,
        events: Vec<Event<'static>>,
        state: &mut RewriteState,
        writer: &mut Writer<Vec<u8>>,
    ) -> Result<(), ChainError> {
        let id = reference_id(&events)?;
        match id.as_deref() {
            Some(PIH_ID) => {
                state.pih_seen = true;
                state.found_pih = reference_body(&events)?;
                let events = match self.pih {
                    Some(pih) => with_body(events, pih),
                    None => events,
                };
                self.write_all(events, writer)
            }
            Some(QR_ID) => {
                state.qr_seen = true;
                if self.canonical {
                    return Ok(());
                }
                let events = match self.qr {
                    Some(qr) => with_body(events, qr),
                    None => events,
                };
                self.write_all(events, writer)
            }
            _ => self.write_all(events, writer),
        }
    }

    fn insert_missing(
        &self,
        state: &mut RewriteState,
        writer: &mut Writer<Vec<u8>>,
    ) -> Result<(), ChainError> {
        if !state.pih_seen {
            if let Some(pih) = self.pih {
                self.write_all(pih_reference(pih), writer)?;
            }
            state.pih_seen = true;
        }
        if !state.qr_seen {
            if let (Some(qr), false) = (self.qr, self.canonical) {
                self.write_all(qr_reference(qr), writer)?;
            }
            state.qr_seen = true;
        }
        Ok(())
    }

    fn write_all(
        &self,
        events: Vec<Event<'static>>,
        writer: &mut Writer<Vec<u8>>,
    ) -> Result<(), ChainError> {
        for event in events {
            self.write(event, writer)?;
        }
        Ok(())
    }

    fn write(&self, event: Event<'_>, writer: &mut Writer<Vec<u8>>) -> Result<(), ChainError> {
        if !self.canonical {
            writer.write_event(event)?;
            return Ok(());
        }
        match event {
            Event::Start(e) => writer.write_event(Event::Start(canonical_start(&e)?))?,
            Event::Empty(e) => {
                let start = canonical_start(&e)?;
                let end = BytesEnd::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                writer.write_event(Event::Start(start))?;
                writer.write_event(Event::End(end))?;
            }
            Event::End(e) => writer.write_event(Event::End(e))?,
            Event::Text(_) | Event::CData(_) => {
                if let Some(text) = text_of(&event)? {
                    if !text.is_empty() {
                        let escaped = partial_escape(&text);
                        writer.write_event(Event::Text(BytesText::from_escaped(escaped)))?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Namespace declarations first, then attributes, each sorted by name.
fn canonical_start(e: &BytesStart<'_>) -> Result<BytesStart<'static>, ChainError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.push((key, value));
    }
    attrs.sort_by(|(a, _), (b, _)| {
        let a_ns = a == "xmlns" || a.starts_with("xmlns:");
        let b_ns = b == "xmlns" || b.starts_with("xmlns:");
        b_ns.cmp(&a_ns).then_with(|| a.cmp(b))
    });
    let mut start = BytesStart::new(name);
    for (key, value) in &attrs {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    Ok(start)
}
