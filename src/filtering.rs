use hickory_proto::op::{Message, OpCode};
use hickory_proto::rr::Record;
use tracing::debug;

use crate::error::QueryError;
use crate::lists::DomainLists;

/// Reject query shapes the gateway never forwards.
pub fn pre_lookup(request: &Message) -> Result<(), QueryError> {
    if request.queries().len() != 1 {
        return Err(QueryError::Format(
            "request must carry exactly one question",
        ));
    }
    if request.op_code() != OpCode::Query {
        return Err(QueryError::Format("non-query opcodes are unsupported"));
    }
    Ok(())
}

/// Drop restricted answer/additional records and strip authority data.
/// Returns the number of records removed.
pub fn post_lookup(reply: &mut Message, lists: &DomainLists) -> usize {
    // Forwarding resolver: never authoritative, never leak delegations.
    reply.set_authoritative(false);
    reply.take_name_servers();

    let (answers, dropped_answers) = retain_allowed(reply.take_answers(), lists);
    reply.insert_answers(answers);

    let (additionals, dropped_additionals) = retain_allowed(reply.take_additionals(), lists);
    reply.insert_additionals(additionals);

    dropped_answers + dropped_additionals
}

fn retain_allowed(records: Vec<Record>, lists: &DomainLists) -> (Vec<Record>, usize) {
    let before = records.len();
    let kept: Vec<Record> = records
        .into_iter()
        .filter(|record| {
            let owner = record.name().to_ascii();
            let restricted = lists.is_restricted(&owner);
            if restricted {
                debug!(owner = %owner, rtype = %record.record_type(), "Dropping restricted record");
            }
            !restricted
        })
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}
