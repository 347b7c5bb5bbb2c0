/// Get the short type name of a resource type.
///
/// E.g. `short_type_name::<k8s_openapi::api::core::v1::Pod>()` returns `Some("Pod")`.
pub fn short_type_name<K>() -> Option<&'static str> {
    let type_name = std::any::type_name::<K>();
    type_name.rsplit("::").next()
}
