/// Steps of the transaction state machine.
///
/// Every asynchronous step `X` is followed by `XComplete`, which receives the
/// step's result. `None` ends the current run of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum State {
    #[default]
    None,
    GetBackend,
    GetBackendComplete,
    SendRequest,
    SendRequestComplete,
    SuccessfulSendRequest,
    NetworkRead,
    NetworkReadComplete,
    InitEntry,
    OpenEntry,
    OpenEntryComplete,
    CreateEntry,
    CreateEntryComplete,
    DoomEntry,
    DoomEntryComplete,
    AddToEntry,
    AddToEntryComplete,
    StartPartialCacheValidation,
    CompletePartialCacheValidation,
    UpdateCachedResponse,
    UpdateCachedResponseComplete,
    OverwriteCachedResponse,
    TruncateCachedData,
    TruncateCachedDataComplete,
    TruncateCachedMetadata,
    TruncateCachedMetadataComplete,
    PartialHeadersReceived,
    CacheReadResponse,
    CacheReadResponseComplete,
    CacheWriteResponse,
    CacheWriteTruncatedResponse,
    CacheWriteResponseComplete,
    CacheReadMetadata,
    CacheReadMetadataComplete,
    CacheQueryData,
    CacheQueryDataComplete,
    CacheReadData,
    CacheReadDataComplete,
    CacheWriteData,
    CacheWriteDataComplete,
}
