//! Per-instance bring-up of the bridge co-processor transport.
//!
//! A [`BridgeDevice`] owns everything one peripheral instance needs — the
//! mailbox, the queue fabric, and (after a successful probe) the bootstrap
//! command pair with its dispatcher. A process may host several instances;
//! nothing here is global.
//!
//! Bring-up order, leaves first:
//! 1. the firmware protocol version handshake over the mailbox;
//! 2. creation of the bootstrap completion queue (QID 0) and the command
//!    dispatcher's submission queue (QID 1);
//! 3. publication of both rings to the device: each ring's memory
//!    configuration descriptor is mapped to-device and its address sent as a
//!    `RegisterCommandCq`/`RegisterCommandSq` mailbox message.
//!
//! The embedding platform routes the two device interrupts to
//! [`BridgeDevice::handle_mailbox_interrupt`] and
//! [`BridgeDevice::handle_completion_interrupt`]. A failed probe tears down
//! whatever was created and is not retried.

#[macro_use] extern crate log;

#[cfg(test)]
mod test;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use zerocopy::AsBytes;

use bridge_cmdq::CommandDispatcher;
use bridge_mailbox::{
    encode_message, message_type, message_value, Mailbox, MSG_REGISTER_COMMAND_CQ,
    MSG_REGISTER_COMMAND_QUEUE_REPLY, MSG_REGISTER_COMMAND_SQ, MSG_SET_FW_PROTOCOL_VERSION,
};
use bridge_platform::{DmaDirection, Platform};
use bridge_queue::{CompletionQueue, QueueFabric, QueueMemcfg};
use bridge_types::{Error, BOOTSTRAP_CQ_QID, BOOTSTRAP_SQ_QID};

/// The firmware protocol version this transport speaks.
pub const PROTOCOL_VERSION: u64 = 0x20001;

/// Element count of the bootstrap command pair.
pub const BOOTSTRAP_EL_COUNT: u16 = 0x20;

struct Bootstrap {
    cmd_cq: Arc<CompletionQueue>,
    cmdq: Arc<CommandDispatcher>,
}

/// One bridge co-processor instance.
pub struct BridgeDevice {
    platform: Arc<dyn Platform>,
    mailbox: Arc<Mailbox>,
    fabric: Arc<QueueFabric>,
    bootstrap: Mutex<Option<Bootstrap>>,
}

impl BridgeDevice {
    /// Builds the instance around its platform adapter. No device I/O
    /// happens here; the platform can route interrupts before
    /// [`probe`](Self::probe) touches the hardware.
    pub fn new(platform: Arc<dyn Platform>) -> BridgeDevice {
        let mailbox = Arc::new(Mailbox::new(platform.clone()));
        let fabric = Arc::new(QueueFabric::new(platform.clone()));
        BridgeDevice { platform, mailbox, fabric, bootstrap: Mutex::new(None) }
    }

    /// The instance's mailbox; the platform routes the mailbox-reply
    /// interrupt to [`Mailbox::handle_interrupt`].
    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// The instance's queue fabric.
    pub fn fabric(&self) -> &Arc<QueueFabric> {
        &self.fabric
    }

    /// The command dispatcher, available once probe succeeded.
    pub fn dispatcher(&self) -> Option<Arc<CommandDispatcher>> {
        self.bootstrap.lock().unwrap().as_ref().map(|b| b.cmdq.clone())
    }

    /// The bootstrap completion queue, available once probe succeeded.
    pub fn command_cq(&self) -> Option<Arc<CompletionQueue>> {
        self.bootstrap.lock().unwrap().as_ref().map(|b| b.cmd_cq.clone())
    }

    /// The mailbox-reply interrupt entry point.
    pub fn handle_mailbox_interrupt(&self) {
        self.mailbox.handle_interrupt();
    }

    /// The DMA interrupt entry point: drains every live completion queue.
    pub fn handle_completion_interrupt(&self) {
        self.fabric.handle_completion_interrupt();
    }

    /// Negotiates the firmware protocol version and registers the bootstrap
    /// command pair. Fails with [`Error::ProtocolDesync`] on any reply the
    /// device contract does not allow; nothing stays created on failure.
    pub fn probe(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let mut bootstrap = self.bootstrap.lock().unwrap();
        if bootstrap.is_some() {
            return Err(Error::Busy);
        }

        self.fw_version_handshake(timeout)?;

        let cmd_cq = self.fabric.create_cq(BOOTSTRAP_EL_COUNT)?;
        debug_assert_eq!(cmd_cq.qid(), BOOTSTRAP_CQ_QID);
        let cmdq = match CommandDispatcher::new(&self.fabric, &cmd_cq, BOOTSTRAP_EL_COUNT) {
            Ok(cmdq) => Arc::new(cmdq),
            Err(e) => {
                self.fabric.destroy_cq(&cmd_cq);
                return Err(e);
            }
        };
        debug_assert_eq!(cmdq.sq().qid(), BOOTSTRAP_SQ_QID);

        // The completion queue must be known to the device before anything
        // is routed at it, so it registers first.
        let registered = self
            .register_bootstrap_queue(MSG_REGISTER_COMMAND_CQ, &cmd_cq.memcfg(0), timeout)
            .and_then(|_| {
                self.register_bootstrap_queue(MSG_REGISTER_COMMAND_SQ, &cmdq.sq().memcfg(), timeout)
            });
        if let Err(e) = registered {
            self.fabric.destroy_sq(cmdq.sq());
            self.fabric.destroy_cq(&cmd_cq);
            return Err(e);
        }

        *bootstrap = Some(Bootstrap { cmd_cq, cmdq });
        info!("bridge_device: probe complete, fw protocol {:#x}", PROTOCOL_VERSION);
        Ok(())
    }

    fn fw_version_handshake(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let reply = self
            .mailbox
            .send(encode_message(MSG_SET_FW_PROTOCOL_VERSION, PROTOCOL_VERSION), timeout)?;
        if message_type(reply) != MSG_SET_FW_PROTOCOL_VERSION
            || message_value(reply) != PROTOCOL_VERSION
        {
            error!(
                "bridge_device: fw version handshake failed: reply {:#x}:{:#x}",
                message_type(reply),
                message_value(reply)
            );
            return Err(Error::ProtocolDesync);
        }
        Ok(())
    }

    /// Publishes one bootstrap ring: maps its memcfg descriptor to-device,
    /// sends the descriptor's address as the message value, and requires the
    /// dedicated registration-reply type.
    fn register_bootstrap_queue(
        &self,
        msg_type: u8,
        memcfg: &QueueMemcfg,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let descriptor = Box::new(*memcfg);
        let len = descriptor.as_bytes().len();
        let dma = self.platform.map_single(
            descriptor.as_bytes().as_ptr(),
            len,
            DmaDirection::ToDevice,
        );
        if dma.is_error() {
            error!("bridge_device: memcfg mapping for qid {} failed", memcfg.qid);
            return Err(Error::MappingFailed);
        }
        let result = self.mailbox.send(encode_message(msg_type, dma.value()), timeout);
        self.platform.unmap_single(dma, len, DmaDirection::ToDevice);
        let reply = result?;
        if message_type(reply) != MSG_REGISTER_COMMAND_QUEUE_REPLY {
            error!(
                "bridge_device: queue registration for qid {} rejected: reply {:#x}:{:#x}",
                memcfg.qid,
                message_type(reply),
                message_value(reply)
            );
            return Err(Error::ProtocolDesync);
        }
        Ok(())
    }
}
