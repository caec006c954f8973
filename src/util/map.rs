/// 訊息的鍵名
pub trait Keyable {
    fn key(&self) -> String;
    /// 含前置字元
    fn key_with_prefix(&self) -> String;
}
