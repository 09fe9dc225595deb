//! Command layer: block operations as request/response round-trips.
//!
//! Each operation allocates a message id, writes one hex envelope line, and
//! awaits the matching response under a bounded timeout. Requests are
//! strictly serialized: the operation lock admits one round-trip at a time,
//! so clients observe FIFO block-op order and composite operations (patch)
//! are atomic from the service's perspective.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::codec::{
    Codec, DecodeMode, DecodeOpts, EncodedRequest, EncodedResponse, Opcode, Payload,
    MSG_ID_MODULUS,
};
use crate::link::{Link, LinkHandler};
use crate::state::StateMachine;
use crate::store::BlockStore;
use crate::{Block, BlockIdent, Error, ErrorKind, Result};

/// Default bound for awaiting a response.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Issues commands to the controller and correlates their responses.
pub struct Commander {
    link: Arc<Link>,
    codec: Arc<Codec>,
    store: Arc<BlockStore>,
    state: Arc<StateMachine>,
    timeout: Duration,
    next_msg_id: AtomicU32,
    pending: Mutex<HashMap<u32, mpsc::Sender<EncodedResponse>>>,
    op_lock: Mutex<()>,
}

impl Commander {
    /// Creates a commander; register it as the link handler before use.
    pub fn new(
        link: Arc<Link>,
        codec: Arc<Codec>,
        store: Arc<BlockStore>,
        state: Arc<StateMachine>,
        timeout: Duration,
    ) -> Self {
        Self {
            link,
            codec,
            store,
            state,
            timeout,
            next_msg_id: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
            op_lock: Mutex::new(()),
        }
    }

    fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().expect("op lock poisoned")
    }

    fn next_id(&self) -> u32 {
        let raw = self.next_msg_id.fetch_add(1, Ordering::SeqCst);
        raw % MSG_ID_MODULUS
    }

    /// One request/response round-trip. Caller must hold the op lock.
    fn execute(&self, opcode: Opcode, payload: Option<Payload>) -> Result<EncodedResponse> {
        let msg_id = self.next_id();
        let request = EncodedRequest::new(msg_id, opcode, payload);
        let line = self.codec.encode_request(&request);

        if !opcode.expects_response() {
            // Reboots and firmware updates reset the connection instead of replying
            self.link.write_line(&line)?;
            return Ok(EncodedResponse::new(
                msg_id,
                crate::codec::DeviceErrorCode::Ok,
                vec![],
            ));
        }

        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(msg_id, tx);

        if let Err(err) = self.link.write_line(&line) {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&msg_id);
            return Err(err);
        }

        let response = match rx.recv_timeout(self.timeout) {
            Ok(response) => response,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&msg_id);
                // A missing response is fatal for the connection
                log::error!("{request} timed out; resetting connection");
                self.link.start_reconnect();
                return Err(Error::timeout(format!("no response for {request}")));
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(Error::not_connected(format!(
                    "connection closed while awaiting {request}"
                )));
            }
        };

        if !response.error.is_ok() {
            if !response.payload.is_empty() {
                log::warn!("{request} failed with {} payload(s) attached", response.payload.len());
            }
            return Err(Error::command_failed(response.error));
        }

        Ok(response)
    }

    /// Builds a [Block] from a response payload.
    ///
    /// Blocks first observed here get a generated string id stored for them.
    fn to_block(&self, payload: &Payload, opts: &DecodeOpts) -> Result<Block> {
        let (block_type, data) = self.codec.decode_block(payload, opts)?;
        let sid = self.store.register_discovered(payload.block_id);

        Ok(Block {
            id: Some(sid),
            nid: payload.block_id,
            block_type,
            subtype: (payload.subtype != 0).then_some(payload.subtype),
            data,
        })
    }

    fn to_block_list(&self, response: &EncodedResponse, opts: &DecodeOpts) -> Vec<Block> {
        response
            .payload
            .iter()
            .filter_map(|payload| match self.to_block(payload, opts) {
                Ok(block) => Some(block),
                Err(err) => {
                    log::warn!("skipping undecodable block {}: {err}", payload.block_id);
                    None
                }
            })
            .collect()
    }

    fn single_block(&self, response: &EncodedResponse, opts: &DecodeOpts) -> Result<Block> {
        let payload = response
            .payload
            .first()
            .ok_or_else(|| Error::malformed("response carries no payload"))?;
        self.to_block(payload, opts)
    }

    /// Resolves a block identity to its numeric id.
    fn resolve_nid(&self, ident: &BlockIdent) -> Result<u16> {
        if let Some(nid) = ident.nid {
            return Ok(nid);
        }
        match &ident.id {
            Some(sid) => self
                .store
                .nid_of(sid)
                .ok_or_else(|| Error::new(ErrorKind::UnknownSid, format!("no block named '{sid}'"))),
            None => Err(Error::failure("block identity without keys")),
        }
    }

    /// Prompts the controller; used as ping and handshake trigger.
    ///
    /// Not gated on synchronization.
    pub fn ping(&self) -> Result<()> {
        let _guard = self.lock_ops();
        self.execute(Opcode::None, None).map(|_| ())
    }

    /// Reads one block.
    pub fn read_block(&self, ident: &BlockIdent) -> Result<Block> {
        self.state.check_synchronized()?;
        let _guard = self.lock_ops();
        self.read_block_inner(ident, &DecodeOpts::default())
    }

    fn read_block_inner(&self, ident: &BlockIdent, opts: &DecodeOpts) -> Result<Block> {
        let nid = self.resolve_nid(ident)?;
        let payload = Payload {
            block_id: nid,
            ..Default::default()
        };
        let response = self.execute(Opcode::ReadObject, Some(payload))?;
        self.single_block(&response, opts)
    }

    /// Reads the persisted form of one block.
    pub fn read_stored_block(&self, ident: &BlockIdent) -> Result<Block> {
        self.state.check_synchronized()?;
        let _guard = self.lock_ops();

        let nid = self.resolve_nid(ident)?;
        let payload = Payload {
            block_id: nid,
            ..Default::default()
        };
        let response = self.execute(Opcode::ReadStoredObject, Some(payload))?;
        self.single_block(
            &response,
            &DecodeOpts {
                mode: DecodeMode::Stored,
                ..Default::default()
            },
        )
    }

    /// Reads the logged view of one block.
    pub fn read_logged_block(&self, ident: &BlockIdent) -> Result<Block> {
        self.state.check_synchronized()?;
        let _guard = self.lock_ops();

        self.read_block_inner(
            ident,
            &DecodeOpts {
                mode: DecodeMode::Logged,
                ..Default::default()
            },
        )
    }

    /// Writes a block.
    pub fn write_block(&self, block: &Block) -> Result<Block> {
        self.state.check_synchronized()?;
        let _guard = self.lock_ops();
        self.write_block_inner(block)
    }

    fn write_block_inner(&self, block: &Block) -> Result<Block> {
        let nid = self.resolve_nid(&block.ident())?;
        let mut payload = self.codec.encode_block(&block.block_type, &block.data)?;
        payload.block_id = nid;

        let response = self.execute(Opcode::WriteObject, Some(payload))?;
        self.single_block(&response, &DecodeOpts::default())
    }

    /// Creates a block.
    ///
    /// The desired numeric id may be 0, in which case the controller assigns
    /// one; the resulting identity pair is stored either way.
    pub fn create_block(&self, block: &Block) -> Result<Block> {
        self.state.check_synchronized()?;
        let _guard = self.lock_ops();

        let sid = block
            .id
            .as_deref()
            .ok_or_else(|| Error::failure("created blocks need a string id"))?;
        if self.store.nid_of(sid).is_some() {
            return Err(Error::new(
                ErrorKind::DuplicateSid,
                format!("block '{sid}' already exists"),
            ));
        }
        if block.nid != 0 && block.nid < crate::USER_NID_START {
            return Err(Error::new(
                ErrorKind::OutOfRange,
                format!("numeric ids below {} are reserved", crate::USER_NID_START),
            ));
        }

        let mut payload = self.codec.encode_block(&block.block_type, &block.data)?;
        payload.block_id = block.nid;

        let response = self.execute(Opcode::CreateObject, Some(payload))?;
        let assigned = response
            .payload
            .first()
            .map(|payload| payload.block_id)
            .unwrap_or(block.nid);
        self.store
            .insert(sid, assigned, Value::Object(Default::default()))?;

        let mut created = self.single_block(&response, &DecodeOpts::default())?;
        created.id = Some(sid.to_string());
        Ok(created)
    }

    /// Deletes a block and its identity entry.
    pub fn delete_block(&self, ident: &BlockIdent) -> Result<()> {
        self.state.check_synchronized()?;
        let _guard = self.lock_ops();

        let nid = self.resolve_nid(ident)?;
        let payload = Payload {
            block_id: nid,
            ..Default::default()
        };
        self.execute(Opcode::DeleteObject, Some(payload))?;

        if let Err(err) = self.store.delete(None, Some(nid)) {
            log::debug!("no identity entry to delete for {nid}: {err}");
        }
        Ok(())
    }

    /// Lists every block on the controller.
    pub fn list_blocks(&self) -> Result<Vec<Block>> {
        self.state.check_synchronized()?;
        let _guard = self.lock_ops();

        let response = self.execute(Opcode::ListObjects, None)?;
        Ok(self.to_block_list(&response, &DecodeOpts::default()))
    }

    /// Lists the persisted form of every block.
    pub fn list_stored_blocks(&self) -> Result<Vec<Block>> {
        self.state.check_synchronized()?;
        let _guard = self.lock_ops();

        let response = self.execute(Opcode::ListStoredObjects, None)?;
        Ok(self.to_block_list(
            &response,
            &DecodeOpts {
                mode: DecodeMode::Stored,
                ..Default::default()
            },
        ))
    }

    /// Lists identities of blocks compatible with a target type.
    pub fn list_compatible_blocks(&self, target_type: &str) -> Result<Vec<BlockIdent>> {
        self.state.check_synchronized()?;
        let _guard = self.lock_ops();

        let objtype = self.codec.registry().type_tag(target_type)?;
        let payload = Payload {
            objtype,
            ..Default::default()
        };
        let response = self.execute(Opcode::ListCompatibleObjects, Some(payload))?;

        Ok(response
            .payload
            .iter()
            .map(|payload| BlockIdent {
                id: self.store.sid_of(payload.block_id),
                nid: Some(payload.block_id),
            })
            .collect())
    }

    /// Asks the controller to scan buses for new hardware blocks.
    pub fn discover_blocks(&self) -> Result<Vec<Block>> {
        self.state.check_synchronized()?;
        let _guard = self.lock_ops();

        let response = self.execute(Opcode::DiscoverObjects, None)?;
        Ok(self.to_block_list(&response, &DecodeOpts::default()))
    }

    /// Removes every user block from the controller and the identity store.
    pub fn clear_blocks(&self) -> Result<usize> {
        self.state.check_synchronized()?;
        let _guard = self.lock_ops();

        let response = self.execute(Opcode::ClearObjects, None)?;
        self.store.clear();
        Ok(response.payload.len())
    }

    /// Read-merge-write under the operation lock.
    pub fn patch_block(&self, ident: &BlockIdent, changes: &Map<String, Value>) -> Result<Block> {
        self.state.check_synchronized()?;
        self.patch_block_unsynced(ident, changes)
    }

    /// Patch variant used by the synchronizer before the synchronized state.
    pub(crate) fn patch_block_unsynced(
        &self,
        ident: &BlockIdent,
        changes: &Map<String, Value>,
    ) -> Result<Block> {
        let _guard = self.lock_ops();

        let mut block = self.read_block_inner(ident, &DecodeOpts::default())?;
        for (key, value) in changes {
            block.data.insert(key.clone(), value.clone());
        }
        self.write_block_inner(&block)
    }

    /// Requests a controller reboot. No reply is expected.
    pub fn reboot(&self) -> Result<()> {
        let _guard = self.lock_ops();
        self.execute(Opcode::Reboot, None).map(|_| ())
    }

    /// Requests a factory reset. No reply is expected.
    pub fn factory_reset(&self) -> Result<()> {
        let _guard = self.lock_ops();
        self.execute(Opcode::FactoryReset, None).map(|_| ())
    }

    /// Tears down the current connection; the link supervisor reconnects.
    pub fn start_link_reconnect(&self) {
        self.link.start_reconnect();
    }

    /// Puts the controller in firmware update mode. No reply is expected.
    pub fn firmware_update(&self) -> Result<()> {
        let _guard = self.lock_ops();
        self.execute(Opcode::FirmwareUpdate, None)?;
        self.state.set_updating();
        Ok(())
    }
}

impl LinkHandler for Commander {
    fn on_response(&self, line: String) {
        match self.codec.decode_response(&line) {
            Ok(response) => {
                let tx = self
                    .pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&response.msg_id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => log::warn!("discarding unmatched response {response}"),
                }
            }
            Err(err) => log::error!("discarding malformed frame: {err}"),
        }
    }

    fn on_disconnect(&self) {
        // Dropping the senders fails every outstanding await
        self.pending.lock().expect("pending lock poisoned").clear();
    }
}
