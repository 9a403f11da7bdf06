//! Object identity tags (`original_source/core/inc/kobjs.h`'s `objID`
//! fields / `RK_*_KOBJ_ID`), checked by every entry point under
//! `RK_CONF_ERR_CHECK` in the original. Kept unconditionally here since the
//! check is cheap and the alternative is undefined behavior on a
//! type-confused object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Semaphore,
    Mutex,
    Event,
    MemPartition,
    Mailbox,
    MesgQueue,
    Stream,
    Port,
    Mrm,
    Timer,
}
