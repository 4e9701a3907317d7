pub(crate) mod exec;
pub(crate) mod timer;
pub(crate) mod weak_opt;

pub(crate) use self::exec::Exec;
pub(crate) use self::timer::Timer;
pub(crate) use self::weak_opt::WeakOpt;
