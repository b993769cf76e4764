//! Request queue and response correlation
//!
//! The [`Dev`] owns every submitted [`CmdReq`] until it completes. Only the
//! request at the head of the queue is on the wire; statuses and responses
//! are matched against its commands by command ID and sequence number.

use heapless::{Deque, Vec};

use crate::{
    cmd_req::{CmdReq, Owner, SrcCmd},
    elem::Elems,
    frame::{CmdId, Header, MsgKind},
    DrvError, STATUS_OK,
};

/// Largest number of requests waiting in the queue, head included
pub const MAX_QUEUED_REQS: usize = 8;

/// Number of modules whose outstanding commands can be counted at once
pub const NUM_MOD_COUNTERS: usize = 15;

/// Number of groups that can subscribe to asynchronous events
pub const NUM_AEC_SLOTS: usize = 15;

/// Identifies a transmitted request in handler callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqId(pub(crate) u16);

/// Something happened to a transmitted request
pub enum CmdEvent<'a> {
    /// One command received its status
    Status {
        /// The command the status belongs to
        src: SrcCmd<'a>,
        /// The status, [`STATUS_OK`] on success
        status: u16,
    },
    /// One command received a response
    Response {
        /// The command the response belongs to
        src: SrcCmd<'a>,
        /// The command ID the chip sent the response with
        id: CmdId,
        /// The response's elements
        elems: Elems<'a>,
    },
    /// Every command has its status; the request is handed back
    ///
    /// This is the last event for a request.
    Complete {
        /// The finished request
        req: CmdReq,
        /// Number of commands in the request
        num_cmds: usize,
        /// Number of commands whose status was not OK
        num_errors: usize,
    },
}

/// An event on its way out of the dispatcher
pub(crate) enum Dispatch<'a> {
    Cmd {
        owner: Owner,
        id: ReqId,
        event: CmdEvent<'a>,
    },
    Aec {
        id: CmdId,
        elems: Elems<'a>,
    },
}

struct Queued {
    id: ReqId,
    req: CmdReq,
    sent: bool,
    num_status: usize,
    num_errors: usize,
}

#[derive(Debug, Clone, Copy)]
struct ModCount {
    module: u8,
    count: u8,
}

impl ModCount {
    const FREE: Self = Self {
        module: 0,
        count: 0,
    };
}

pub(crate) struct Dev {
    queue: Deque<Queued, MAX_QUEUED_REQS>,
    next_seq: u16,
    next_req: u16,
    mod_counts: [ModCount; NUM_MOD_COUNTERS],
    aec_groups: Vec<u8, NUM_AEC_SLOTS>,
    bus_error: bool,
}

impl Dev {
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
            next_seq: 0,
            next_req: 0,
            mod_counts: [ModCount::FREE; NUM_MOD_COUNTERS],
            aec_groups: Vec::new(),
            bus_error: false,
        }
    }

    pub fn transmit(&mut self, mut req: CmdReq) -> Result<ReqId, DrvError> {
        if self.bus_error {
            return Err(DrvError::RequestError);
        }
        if req.is_poisoned() || req.num_cmds() == 0 {
            return Err(DrvError::InvalidArg);
        }
        if self.queue.is_full() {
            return Err(DrvError::RetryRequest);
        }

        let mut counts = self.mod_counts;
        for id in req.cmd_ids() {
            mod_count_inc(&mut counts, id.group())?;
        }
        req.assign_seqs(&mut self.next_seq);
        let id = ReqId(self.next_req);
        self.next_req = self.next_req.wrapping_add(1);

        let queued = Queued {
            id,
            req,
            sent: false,
            num_status: 0,
            num_errors: 0,
        };
        if self.queue.push_back(queued).is_err() {
            return Err(DrvError::RetryRequest);
        }
        self.mod_counts = counts;
        Ok(id)
    }

    /// The head request, if it still needs to be written
    pub fn unsent_head(&self) -> Option<&CmdReq> {
        self.queue.front().filter(|q| !q.sent).map(|q| &q.req)
    }

    pub fn mark_head_sent(&mut self) {
        if let Some(head) = self.queue.front_mut() {
            head.sent = true;
        }
    }

    pub fn bus_error(&self) -> bool {
        self.bus_error
    }

    pub fn set_bus_error(&mut self) {
        if !self.bus_error {
            nut_error!("bus error latched");
        }
        self.bus_error = true;
    }

    /// Retire every queued request as failed
    ///
    /// Each request gets its terminal event with every command counted
    /// as an error.
    pub fn flush<F>(&mut self, mut sink: F)
    where
        F: FnMut(Dispatch<'_>),
    {
        while let Some(q) = self.queue.pop_front() {
            let num_cmds = q.req.num_cmds();
            for (idx, id) in q.req.cmd_ids().enumerate() {
                if q.req.status(idx).is_none() {
                    mod_count_dec(&mut self.mod_counts, id.group());
                }
            }
            nut_warn!("flushing request with {} commands", num_cmds);
            sink(Dispatch::Cmd {
                owner: q.req.owner(),
                id: q.id,
                event: CmdEvent::Complete {
                    req: q.req,
                    num_cmds,
                    num_errors: num_cmds,
                },
            });
        }
    }

    pub fn mod_req_count(&self, module: u8) -> u8 {
        self.mod_counts
            .iter()
            .find(|m| m.module == module && module != 0)
            .map(|m| m.count)
            .unwrap_or(0)
    }

    pub fn aec_register(&mut self, group: u8) -> Result<(), DrvError> {
        if self.aec_groups.contains(&group) {
            return Ok(());
        }
        self.aec_groups.push(group).map_err(|_| DrvError::NoSpace)
    }

    pub fn aec_deregister(&mut self, group: u8) {
        if let Some(pos) = self.aec_groups.iter().position(|g| *g == group) {
            self.aec_groups.swap_remove(pos);
        }
    }

    /// Route one validated Rsp, Status or Aec frame
    pub fn handle<F>(&mut self, hdr: &Header, payload: &[u8], mut sink: F)
    where
        F: FnMut(Dispatch<'_>),
    {
        let id = hdr.id();
        match hdr.kind {
            MsgKind::Status => {
                let Some(status) = payload.get(..2).map(|b| u16::from_be_bytes([b[0], b[1]])) else {
                    nut_error!("short status frame for {}", id.0);
                    return;
                };
                self.handle_status(id, hdr.seq, status, &mut sink);
            }
            MsgKind::Rsp => {
                let Some(elems) = Elems::new(hdr.num_elems, payload) else {
                    nut_error!("malformed response for {}", id.0);
                    return;
                };
                let Some(head) = self.queue.front().filter(|q| q.sent) else {
                    nut_debug!("response {} seq {} with nothing in flight", id.0, hdr.seq);
                    return;
                };
                let Some(src) = head.req.match_cmd(id, hdr.seq).and_then(|i| head.req.src_cmd(i)) else {
                    nut_debug!("response {} seq {} matches no command", id.0, hdr.seq);
                    return;
                };
                sink(Dispatch::Cmd {
                    owner: head.req.owner(),
                    id: head.id,
                    event: CmdEvent::Response { src, id, elems },
                });
            }
            MsgKind::Aec => {
                let Some(elems) = Elems::new(hdr.num_elems, payload) else {
                    nut_error!("malformed event {}", id.0);
                    return;
                };
                if self.aec_groups.contains(&id.group()) {
                    sink(Dispatch::Aec { id, elems });
                } else {
                    nut_trace!("unsubscribed event {}", id.0);
                }
            }
            MsgKind::Raw | MsgKind::Req => {
                nut_error!("unexpected frame kind for {}", id.0);
            }
        }
    }

    fn handle_status<F>(&mut self, id: CmdId, seq: u16, status: u16, sink: &mut F)
    where
        F: FnMut(Dispatch<'_>),
    {
        let Dev {
            queue, mod_counts, ..
        } = self;
        let Some(head) = queue.front_mut().filter(|q| q.sent) else {
            nut_debug!("status {} seq {} with nothing in flight", id.0, seq);
            return;
        };
        let Some(idx) = head.req.match_cmd(id, seq) else {
            nut_debug!("status {} seq {} matches no command", id.0, seq);
            return;
        };

        head.req.set_status(idx, status);
        head.num_status += 1;
        if status != STATUS_OK {
            head.num_errors += 1;
        }
        mod_count_dec(mod_counts, id.group());

        let done = head.num_status >= head.req.num_cmds();
        if let Some(src) = head.req.src_cmd(idx) {
            sink(Dispatch::Cmd {
                owner: head.req.owner(),
                id: head.id,
                event: CmdEvent::Status { src, status },
            });
        }

        if done {
            if let Some(q) = queue.pop_front() {
                let num_cmds = q.req.num_cmds();
                sink(Dispatch::Cmd {
                    owner: q.req.owner(),
                    id: q.id,
                    event: CmdEvent::Complete {
                        req: q.req,
                        num_cmds,
                        num_errors: q.num_errors,
                    },
                });
            }
        }
    }
}

/// Count one more command against `module`
///
/// Refuses with [`DrvError::RetryRequest`] when the counter is full or no
/// counter slot is free.
fn mod_count_inc(counts: &mut [ModCount], module: u8) -> Result<(), DrvError> {
    if module == 0 {
        return Ok(());
    }
    if let Some(slot) = counts.iter_mut().find(|m| m.module == module) {
        slot.count = slot.count.checked_add(1).ok_or_else(|| {
            nut_warn!("counter for module {} is full", module);
            DrvError::RetryRequest
        })?;
        return Ok(());
    }
    match counts.iter_mut().find(|m| m.module == 0) {
        Some(slot) => {
            *slot = ModCount { module, count: 1 };
            Ok(())
        }
        None => {
            nut_warn!("no counter slot for module {}", module);
            Err(DrvError::RetryRequest)
        }
    }
}

fn mod_count_dec(counts: &mut [ModCount], module: u8) {
    if module == 0 {
        return;
    }
    if let Some(slot) = counts.iter_mut().find(|m| m.module == module) {
        slot.count = slot.count.saturating_sub(1);
        if slot.count == 0 {
            *slot = ModCount::FREE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        elem::Param,
        frame::{group, FRAME_HDR_SIZE},
    };
    use std::vec::Vec;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Status { id: ReqId, idx: usize, status: u16 },
        Rsp { id: ReqId, idx: usize, first: Option<u32> },
        Complete { id: ReqId, num_cmds: usize, num_errors: usize },
        Aec { id: CmdId },
    }

    fn record(seen: &mut Vec<Seen>) -> impl FnMut(Dispatch<'_>) + '_ {
        move |d| match d {
            Dispatch::Cmd { id, event, .. } => match event {
                CmdEvent::Status { src, status } => seen.push(Seen::Status {
                    id,
                    idx: src.idx,
                    status,
                }),
                CmdEvent::Response { src, elems, .. } => seen.push(Seen::Rsp {
                    id,
                    idx: src.idx,
                    first: elems.get(0).and_then(|e| e.as_u32()),
                }),
                CmdEvent::Complete {
                    num_cmds,
                    num_errors,
                    ..
                } => seen.push(Seen::Complete {
                    id,
                    num_cmds,
                    num_errors,
                }),
            },
            Dispatch::Aec { id, .. } => seen.push(Seen::Aec { id }),
        }
    }

    fn status_hdr(id: CmdId, seq: u16) -> Header {
        Header {
            group: id.group(),
            opcode: id.opcode(),
            len: FRAME_HDR_SIZE as u16 + 2,
            kind: MsgKind::Status,
            num_elems: 0,
            seq,
        }
    }

    fn two_cmd_req() -> CmdReq {
        let mut req = CmdReq::new(64, 2, Owner::App(1)).unwrap();
        req.append(group::WIFI, 10, &[Param::UInt(1)]).unwrap();
        req.append(group::WIFI, 11, &[]).unwrap();
        req
    }

    #[test]
    fn burst_completes_once_after_every_status() {
        let mut dev = Dev::new();
        let id = dev.transmit(two_cmd_req()).unwrap();
        dev.mark_head_sent();
        assert_eq!(dev.mod_req_count(group::WIFI), 2);

        let mut seen = Vec::new();
        dev.handle(&status_hdr(CmdId::new(group::WIFI, 11), 1), &[0, 5], record(&mut seen));
        dev.handle(&status_hdr(CmdId::new(group::WIFI, 10), 0), &[0, 0], record(&mut seen));
        // a late duplicate matches nothing
        dev.handle(&status_hdr(CmdId::new(group::WIFI, 10), 0), &[0, 0], record(&mut seen));

        assert_eq!(
            seen,
            [
                Seen::Status { id, idx: 1, status: 5 },
                Seen::Status { id, idx: 0, status: 0 },
                Seen::Complete {
                    id,
                    num_cmds: 2,
                    num_errors: 1
                },
            ]
        );
        assert_eq!(dev.mod_req_count(group::WIFI), 0);
        assert!(dev.unsent_head().is_none());
    }

    #[test]
    fn responses_carry_source_command() {
        let mut dev = Dev::new();
        let id = dev.transmit(two_cmd_req()).unwrap();

        let mut payload = [0u8; 8];
        let used = Param::UInt(77).encode(&mut payload).unwrap();
        let hdr = Header {
            group: group::WIFI,
            opcode: 10,
            len: (FRAME_HDR_SIZE + used) as u16,
            kind: MsgKind::Rsp,
            num_elems: 1,
            seq: 0,
        };

        let mut seen = Vec::new();
        // not yet on the wire
        dev.handle(&hdr, &payload, record(&mut seen));
        assert!(seen.is_empty());

        dev.mark_head_sent();
        dev.handle(&hdr, &payload, record(&mut seen));
        assert_eq!(seen, [Seen::Rsp { id, idx: 0, first: Some(77) }]);

        // malformed elements are dropped
        seen.clear();
        dev.handle(&hdr, &payload[..6], record(&mut seen));
        assert!(seen.is_empty());
    }

    #[test]
    fn mismatched_seq_is_ignored() {
        let mut dev = Dev::new();
        dev.transmit(two_cmd_req()).unwrap();
        dev.mark_head_sent();
        let mut seen = Vec::new();
        dev.handle(&status_hdr(CmdId::new(group::WIFI, 10), 9), &[0, 0], record(&mut seen));
        dev.handle(&status_hdr(CmdId::new(group::WIFI, 10), 0), &[0], record(&mut seen));
        assert!(seen.is_empty());
        assert_eq!(dev.mod_req_count(group::WIFI), 2);
    }

    #[test]
    fn second_request_waits_for_first() {
        let mut dev = Dev::new();
        let mut one = CmdReq::new(16, 1, Owner::App(0)).unwrap();
        one.append(group::IP, 1, &[]).unwrap();
        let mut two = CmdReq::new(16, 1, Owner::App(0)).unwrap();
        two.append(group::IP, 2, &[]).unwrap();
        dev.transmit(one).unwrap();
        dev.transmit(two).unwrap();

        dev.mark_head_sent();
        assert!(dev.unsent_head().is_none());

        let mut seen = Vec::new();
        // status for the second request's command arrives early
        dev.handle(&status_hdr(CmdId::new(group::IP, 2), 1), &[0, 0], record(&mut seen));
        assert!(seen.is_empty());

        dev.handle(&status_hdr(CmdId::new(group::IP, 1), 0), &[0, 0], record(&mut seen));
        assert_eq!(seen.len(), 2);
        let head = dev.unsent_head().unwrap();
        assert_eq!(head.cmd_ids().next(), Some(CmdId::new(group::IP, 2)));
    }

    #[test]
    fn transmit_refusals() {
        let mut dev = Dev::new();
        let empty = CmdReq::new(16, 1, Owner::App(0)).unwrap();
        assert_eq!(dev.transmit(empty), Err(DrvError::InvalidArg));

        let mut poisoned = CmdReq::new(16, 1, Owner::App(0)).unwrap();
        let _ = poisoned.append(group::IP, 1, &[Param::UInt(1), Param::UInt(2)]);
        assert_eq!(dev.transmit(poisoned), Err(DrvError::InvalidArg));

        for _ in 0..MAX_QUEUED_REQS {
            let mut req = CmdReq::new(16, 1, Owner::App(0)).unwrap();
            req.append(group::IP, 1, &[]).unwrap();
            dev.transmit(req).unwrap();
        }
        let mut extra = CmdReq::new(16, 1, Owner::App(0)).unwrap();
        extra.append(group::IP, 1, &[]).unwrap();
        assert_eq!(dev.transmit(extra), Err(DrvError::RetryRequest));

        dev.set_bus_error();
        let mut late = CmdReq::new(16, 1, Owner::App(0)).unwrap();
        late.append(group::IP, 1, &[]).unwrap();
        assert_eq!(dev.transmit(late), Err(DrvError::RequestError));
    }

    #[test]
    fn flush_fails_everything_queued() {
        let mut dev = Dev::new();
        let a = dev.transmit(two_cmd_req()).unwrap();
        let b = dev.transmit(two_cmd_req()).unwrap();
        dev.mark_head_sent();
        let mut seen = Vec::new();
        dev.handle(&status_hdr(CmdId::new(group::WIFI, 10), 0), &[0, 0], record(&mut seen));
        seen.clear();

        dev.flush(record(&mut seen));
        assert_eq!(
            seen,
            [
                Seen::Complete {
                    id: a,
                    num_cmds: 2,
                    num_errors: 2
                },
                Seen::Complete {
                    id: b,
                    num_cmds: 2,
                    num_errors: 2
                },
            ]
        );
        assert_eq!(dev.mod_req_count(group::WIFI), 0);
    }

    #[test]
    fn module_counters_free_and_refuse() {
        let mut counts = [ModCount::FREE; 2];
        mod_count_inc(&mut counts, 0).unwrap();
        assert_eq!(counts[0].module, 0);

        for _ in 0..255 {
            mod_count_inc(&mut counts, 4).unwrap();
        }
        assert_eq!(mod_count_inc(&mut counts, 4), Err(DrvError::RetryRequest));
        assert_eq!(counts[0].count, 255);

        mod_count_inc(&mut counts, 5).unwrap();
        assert_eq!(mod_count_inc(&mut counts, 6), Err(DrvError::RetryRequest));
        assert_eq!(counts[1].module, 5);

        mod_count_dec(&mut counts, 5);
        assert_eq!(counts[1].module, 0);
        mod_count_inc(&mut counts, 6).unwrap();
    }

    #[test]
    fn request_without_counter_slot_is_refused_whole() {
        let mut dev = Dev::new();
        let mut module = 1;
        for _ in 0..4 {
            let mut req = CmdReq::new(64, 4, Owner::App(0)).unwrap();
            for _ in 0..4 {
                if module as usize <= NUM_MOD_COUNTERS {
                    req.append(module, 1, &[]).unwrap();
                    module += 1;
                }
            }
            dev.transmit(req).unwrap();
        }
        assert_eq!(dev.mod_req_count(NUM_MOD_COUNTERS as u8), 1);

        // one known module, one that has no slot left
        let mut req = CmdReq::new(64, 2, Owner::App(0)).unwrap();
        req.append(1, 2, &[]).unwrap();
        req.append(module, 1, &[]).unwrap();
        assert_eq!(dev.transmit(req), Err(DrvError::RetryRequest));
        assert_eq!(dev.mod_req_count(1), 1);
        assert_eq!(dev.mod_req_count(module), 0);
        assert_eq!(dev.queue.len(), 4);

        let mut known = CmdReq::new(64, 1, Owner::App(0)).unwrap();
        known.append(1, 2, &[]).unwrap();
        dev.transmit(known).unwrap();
        assert_eq!(dev.mod_req_count(1), 2);
    }

    #[test]
    fn events_need_subscription() {
        let mut dev = Dev::new();
        let hdr = Header {
            group: group::WIFI,
            opcode: 99,
            len: FRAME_HDR_SIZE as u16,
            kind: MsgKind::Aec,
            num_elems: 0,
            seq: 0,
        };
        let mut seen = Vec::new();
        dev.handle(&hdr, &[], record(&mut seen));
        assert!(seen.is_empty());

        dev.aec_register(group::WIFI).unwrap();
        dev.aec_register(group::WIFI).unwrap();
        dev.handle(&hdr, &[], record(&mut seen));
        assert_eq!(seen, [Seen::Aec { id: CmdId::new(group::WIFI, 99) }]);

        dev.aec_deregister(group::WIFI);
        dev.handle(&hdr, &[], record(&mut seen));
        assert_eq!(seen.len(), 1);
    }
}
