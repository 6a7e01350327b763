//! The eight layers of the protocol stack, one module each, registered with a [crate::Dispatcher]
//! in the dependency order §4.9 describes: PL, EPFD, ELD, BEB, EC, (EP, created per-epoch by UC),
//! UC, APP.

pub mod app;
pub mod beb;
pub mod ec;
pub mod eld;
pub mod ep;
pub mod epfd;
pub mod pl;
pub mod uc;

pub fn register_biometrics(collector: &biometrics::Collector) {
    pl::register_biometrics(collector);
    beb::register_biometrics(collector);
    epfd::register_biometrics(collector);
    eld::register_biometrics(collector);
    ec::register_biometrics(collector);
    ep::register_biometrics(collector);
    uc::register_biometrics(collector);
    app::register_biometrics(collector);
}
