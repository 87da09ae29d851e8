//! Misdirection and idempotence decisions.

use tide_pg::PlacementGroup;
use tide_types::{ClientMessage, OpFlags, OpInfo, OpReply, errno};

/// Whether `msg` reached a non-primary that must not serve it.
///
/// Only meaningful when this node is not the primary. Side-effecting or
/// unflagged ops belong to the primary; a pure read flagged for balancing or
/// localization may be served by any node holding a replica role.
pub fn is_misdirected(msg: &ClientMessage, info: &OpInfo, pg: &dyn PlacementGroup) -> bool {
    if !msg
        .flags
        .intersects(OpFlags::BALANCE_READS | OpFlags::LOCALIZE_READS)
    {
        return true;
    }
    if !info.may_read() {
        return true;
    }
    if info.may_write() || info.may_cache() {
        return true;
    }
    !pg.is_nonprimary()
}

/// Reply replaying the recorded result of an already completed request.
///
/// Every sub-op gets an entry carrying the recorded result and no output.
pub fn completed_reply(msg: &ClientMessage, pg: &dyn PlacementGroup, result: i32) -> OpReply {
    OpReply::new(
        msg,
        result,
        pg.map_epoch(),
        OpFlags::ACK | OpFlags::ONDISK,
        false,
    )
}

/// "Try again" reply sent by a non-primary that cannot serve a read.
///
/// Per-op results are attached only when the client asked for them.
pub fn eagain_reply(msg: &ClientMessage, pg: &dyn PlacementGroup) -> OpReply {
    OpReply::new(
        msg,
        -errno::EAGAIN,
        pg.map_epoch(),
        msg.flags & (OpFlags::ACK | OpFlags::ONDISK),
        !msg.has_flag(OpFlags::RETURNVEC),
    )
}

#[cfg(test)]
mod tests {
    use tide_pg::{MemoryPg, PgRole};
    use tide_types::{Epoch, PgId, RequestId, SubOp};

    use super::*;

    fn msg(ops: Vec<SubOp>, flags: OpFlags) -> (ClientMessage, OpInfo) {
        let m = ClientMessage::new(
            RequestId {
                client: 1,
                incarnation: 0,
                tid: 1,
            },
            PgId::new(1, 0),
            "obj",
            ops,
        )
        .with_flags(flags);
        let info = OpInfo::from_ops(m.ops());
        (m, info)
    }

    fn replica() -> MemoryPg {
        MemoryPg::new(PgId::new(1, 0), Epoch(1)).with_role(PgRole::Replica)
    }

    fn read() -> Vec<SubOp> {
        vec![SubOp::Read {
            offset: 0,
            length: 0,
        }]
    }

    #[test]
    fn test_unflagged_read_is_misdirected() {
        let (m, info) = msg(read(), OpFlags::ACK);
        assert!(is_misdirected(&m, &info, &replica()));
    }

    #[test]
    fn test_balanced_read_on_replica_is_served() {
        let (m, info) = msg(read(), OpFlags::ACK | OpFlags::BALANCE_READS);
        assert!(!is_misdirected(&m, &info, &replica()));

        let (m, info) = msg(vec![SubOp::Stat], OpFlags::LOCALIZE_READS);
        assert!(!is_misdirected(&m, &info, &replica()));
    }

    #[test]
    fn test_flagged_op_without_read_is_misdirected() {
        let (m, info) = msg(vec![SubOp::Create { exclusive: false }], OpFlags::BALANCE_READS);
        assert!(is_misdirected(&m, &info, &replica()));

        let (m, info) = msg(vec![], OpFlags::BALANCE_READS);
        assert!(is_misdirected(&m, &info, &replica()));
    }

    #[test]
    fn test_flagged_write_or_cache_is_misdirected() {
        let mut ops = read();
        ops.push(SubOp::WriteFull { data: vec![1] });
        let (m, info) = msg(ops, OpFlags::BALANCE_READS);
        assert!(is_misdirected(&m, &info, &replica()));

        let mut ops = read();
        ops.push(SubOp::CacheEvict);
        let (m, info) = msg(ops, OpFlags::LOCALIZE_READS);
        assert!(is_misdirected(&m, &info, &replica()));
    }

    #[test]
    fn test_balanced_read_on_stray_is_misdirected() {
        let stray = MemoryPg::new(PgId::new(1, 0), Epoch(1)).with_role(PgRole::Stray);
        let (m, info) = msg(read(), OpFlags::BALANCE_READS);
        assert!(is_misdirected(&m, &info, &stray));
    }

    #[test]
    fn test_eagain_reply_honours_returnvec() {
        let pg = replica();
        let (m, _) = msg(read(), OpFlags::ACK | OpFlags::BALANCE_READS);
        let reply = eagain_reply(&m, &pg);
        assert_eq!(reply.result, -errno::EAGAIN);
        assert_eq!(reply.flags, OpFlags::ACK);
        assert!(reply.results.is_empty());

        let (m, _) = msg(
            read(),
            OpFlags::ACK | OpFlags::ONDISK | OpFlags::BALANCE_READS | OpFlags::RETURNVEC,
        );
        let reply = eagain_reply(&m, &pg);
        assert_eq!(reply.flags, OpFlags::ACK | OpFlags::ONDISK);
        assert_eq!(reply.results.len(), 1);
    }

    #[test]
    fn test_completed_reply_carries_recorded_code() {
        let pg = MemoryPg::new(PgId::new(1, 0), Epoch(6));
        let (m, _) = msg(vec![SubOp::Delete], OpFlags::empty());
        let reply = completed_reply(&m, &pg, -errno::ENOENT);
        assert_eq!(reply.result, -errno::ENOENT);
        assert_eq!(reply.flags, OpFlags::ACK | OpFlags::ONDISK);
        assert_eq!(reply.epoch, Epoch(6));
        assert_eq!(reply.results.len(), 1);
        assert_eq!(reply.results[0].rval, -errno::ENOENT);
        assert!(reply.results[0].out.is_empty());
    }
}
