/// Release builds stamp `ROUTEPLANE_BUILD_VERSION`; otherwise the crate version is reported.
pub const VERSION: &str = match option_env!("ROUTEPLANE_BUILD_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};
