//! 服务器选择模块
//!
//! 在当前可用的服务器之间轮询，跳过不可用的节点。

/// 轮询选择器
#[derive(Debug, Default, Clone)]
pub struct RoundRobinSelector {
    cursor: usize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从上次选中位置之后开始，返回第一个可用节点的下标
    ///
    /// # 参数
    /// - available: 每个节点是否可用
    pub fn select(&mut self, available: &[bool]) -> Option<usize> {
        let len = available.len();
        if len == 0 {
            return None;
        }
        for offset in 0..len {
            let idx = (self.cursor + offset) % len;
            if available[idx] {
                self.cursor = (idx + 1) % len;
                return Some(idx);
            }
        }
        None
    }

    /// 与`select`相同，但排除指定节点(用于换节点重试)
    pub fn select_excluding(&mut self, available: &[bool], excluded: usize) -> Option<usize> {
        let filtered: Vec<bool> = available
            .iter()
            .enumerate()
            .map(|(i, ok)| *ok && i != excluded)
            .collect();
        self.select(&filtered)
    }

    /// 重置游标
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotates_across_available() {
        let mut selector = RoundRobinSelector::new();
        let available = [true, true, true];
        let picks: Vec<_> = (0..6).filter_map(|_| selector.select(&available)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_skips_unavailable() {
        let mut selector = RoundRobinSelector::new();
        let available = [true, false, true];
        assert_eq!(selector.select(&available), Some(0));
        assert_eq!(selector.select(&available), Some(2));
        assert_eq!(selector.select(&available), Some(0));
    }

    #[test]
    fn test_none_when_nothing_available() {
        let mut selector = RoundRobinSelector::new();
        assert_eq!(selector.select(&[]), None);
        assert_eq!(selector.select(&[false, false]), None);
    }

    #[test]
    fn test_select_excluding() {
        let mut selector = RoundRobinSelector::new();
        let available = [true, true];
        assert_eq!(selector.select_excluding(&available, 0), Some(1));
        assert_eq!(selector.select_excluding(&[true, false], 0), None);
    }
}
