//! 固定容量、最新在前的滚动缓冲区
//!
//! 用于信号、成交、告警这类只追加的高频推送，无论连接存活多久内存都有上界。

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub struct RollingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingBuffer<T> {
    /// 容量为0时按1处理
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// 插到最前面，超出容量时淘汰最旧的一条并返回它
    pub fn push(&mut self, item: T) -> Option<T> {
        self.items.push_front(item);
        if self.items.len() > self.capacity {
            self.items.pop_back()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 最新的一条
    pub fn newest(&self) -> Option<&T> {
        self.items.front()
    }

    /// 从新到旧遍历
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> RollingBuffer<T> {
    /// 从新到旧的副本
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}
