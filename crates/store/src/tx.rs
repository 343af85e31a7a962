/// A batch of writes applied as one atomic commit.
#[derive(Debug, Default)]
pub struct Transaction {
    pub ops: Vec<Operation>,
}

#[derive(Debug)]
pub enum Operation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Transaction {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(Operation::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(Operation::Delete { key });
    }
}
