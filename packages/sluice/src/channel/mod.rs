// implementation of sluice channels and select.
//
// the basic architecture is vaguely inspired by flume. it is as such:
//
// channel handles wrap around Arc<Mutex<shared state>>
//                                         |
//          /------------------------------/
//          v
//       shared state
//          |
//          |------ it contains the element storage, whose shape depends on the channel kind:
//          |       nothing for rendezvous, a bounded or unbounded ring::Ring<T>, or a single
//          |       overwritable slot for conflated
//          |
//          |------ it contains a "send node queue":
//          |
//          |       this is a linked queue of nodes each of which corresponds to a parked send
//          |       operation. the operation has a pointer directly to its node, although
//          |       dereferencing that pointer is still guarded by the central mutex. the node
//          |       has a slot for the message, a slot for a Waker, a status, and optionally a
//          |       select block it belongs to. a node is resolved at most once, and only while
//          |       its status is waiting and its select block (if any) is claimed for it.
//          |
//          \------ it contains a "recv node queue", which is the same idea for recv operations.
//
// there are also atomic counters for operation outcomes and a mirrored closed flag.
//
// blocking versions of operations are built as a layer on top of the futures, in a low-cost way
// in the polling module that does some scary tricks with memory.
//
// the organization of these modules is as such:
//
//      These are used like
//      library utilities:
//    /--------------------\
//
//      ring<------------------core: This is the sin-eater of the unsafety. It presents an
//                   |         ^ ^   abstraction for channels which is fully safe and sound, but
//      node_queue<--/         | |   panicky and inconvenient.
//                             | |
//      polling<---------------|-select: Waits on many core operations at once, completing
//         ^                   |         exactly one of them.
//         |                   |
//         \-------------------api: This is a wrapper around core that adapts it into an API that
//                                  is convenient and defensive. The crate re-exports this API
//                                  publically.
//
// there is also the error module, which contains the relevant error types, which is also
// re-exported publically, and the kind module, which describes channel capacity.

pub(crate) mod error;
pub(crate) mod api;
pub(crate) mod kind;
pub(crate) mod select;
pub(crate) mod polling;

mod ring;
mod node_queue;
mod core;

pub use self::{
    api::{Channel, ChannelStats},
    kind::{ChannelKind, MAX_BOUND},
    polling::{
        Timeout,
        CANCEL_POLL_INTERVAL,
        set_cancel_poll_interval,
        cancel_poll_interval,
    },
    select::{Select, ProbeOrder},
};
