#[cfg(test)]
mod test_mailbox;
