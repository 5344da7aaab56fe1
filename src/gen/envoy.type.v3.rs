/// HTTP status.
///
/// The status code is carried as its numeric value; see
/// ``envoy.type.v3.StatusCode`` for the named codes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HttpStatus {
    /// Supplies HTTP response code.
    #[prost(int32, tag = "1")]
    pub code: i32,
}
